//! Background Scheduler: a named-job registry that generalizes
//! a single periodic task into a small cooperative scheduler shared by the
//! retention, archive, and alarm control loops.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A periodic unit of work. Each job runs on its own interval and is never
/// invoked concurrently with itself, though distinct jobs run independently.
pub trait ScheduledJob: Send + Sync + 'static {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>>;
}

impl<T: ScheduledJob> ScheduledJob for Arc<T> {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        (**self).run()
    }
}

struct JobHandle {
    handle: JoinHandle<()>,
    run_now: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    failures: Arc<AtomicU64>,
}

/// Registers and drives named periodic jobs with up to 10% jitter per run
/// and a per-job failure counter (`job.<name>.failures`), so one stuck
/// loop never starves the others.
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { jobs: Mutex::new(HashMap::new()) }
    }

    /// Spawns `job` to run every `interval`, jittered by up to 10% of the
    /// interval on each tick so concurrently-started jobs fan out instead
    /// of firing in lockstep.
    pub fn register<J: ScheduledJob>(&self, name: impl Into<String>, interval: Duration, job: J) {
        let name = name.into();
        let shutdown = Arc::new(AtomicBool::new(false));
        let run_now = Arc::new(Notify::new());
        let failures = Arc::new(AtomicU64::new(0));

        let loop_shutdown = Arc::clone(&shutdown);
        let loop_run_now = Arc::clone(&run_now);
        let loop_failures = Arc::clone(&failures);
        let loop_name = name.clone();

        let handle = tokio::spawn(async move {
            tracing::info!(job = %loop_name, interval_ms = interval.as_millis(), "scheduler job starting");
            loop {
                if loop_shutdown.load(Ordering::SeqCst) {
                    break;
                }

                let jittered = jittered_delay(interval);
                tokio::select! {
                    _ = tokio::time::sleep(jittered) => {},
                    _ = loop_run_now.notified() => {},
                }

                if loop_shutdown.load(Ordering::SeqCst) {
                    break;
                }

                let started = Utc::now().timestamp_millis();
                match job.run().await {
                    Ok(()) => {
                        tracing::debug!(
                            job = %loop_name,
                            elapsed_ms = Utc::now().timestamp_millis() - started,
                            "scheduler job completed"
                        );
                    },
                    Err(err) => {
                        let total = loop_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::error!(job = %loop_name, %err, total_failures = total, "scheduler job failed");
                    },
                }
            }
            tracing::info!(job = %loop_name, "scheduler job stopped");
        });

        self.jobs.lock().insert(name, JobHandle { handle, run_now, shutdown, failures });
    }

    /// Wakes a job immediately instead of waiting for its next tick.
    pub fn run_now(&self, name: &str) -> bool {
        match self.jobs.lock().get(name) {
            Some(job) => {
                job.run_now.notify_one();
                true
            },
            None => false,
        }
    }

    pub fn failure_count(&self, name: &str) -> Option<u64> {
        self.jobs.lock().get(name).map(|j| j.failures.load(Ordering::Relaxed))
    }

    /// `job.<name>.failures` for every currently registered job.
    pub fn failure_counts(&self) -> HashMap<String, u64> {
        self.jobs
            .lock()
            .iter()
            .map(|(name, job)| (name.clone(), job.failures.load(Ordering::Relaxed)))
            .collect()
    }

    /// Signals every job to stop after its current iteration and awaits
    /// them all within `grace_period`.
    pub async fn shutdown(&self, grace_period: Duration) {
        let jobs: Vec<(String, JobHandle)> = self.jobs.lock().drain().collect();
        for (_, job) in &jobs {
            job.shutdown.store(true, Ordering::SeqCst);
            job.run_now.notify_one();
        }
        for (name, job) in jobs {
            if tokio::time::timeout(grace_period, job.handle).await.is_err() {
                tracing::warn!(job = %name, "scheduler job did not stop within grace period");
            }
        }
    }
}

fn jittered_delay(interval: Duration) -> Duration {
    let base_ms = interval.as_millis() as u64;
    let jitter_bound = base_ms / 10;
    if jitter_bound == 0 {
        return interval;
    }
    let jitter = pseudo_random(jitter_bound * 2) as i64 - jitter_bound as i64;
    Duration::from_millis((base_ms as i64 + jitter).max(0) as u64)
}

/// A deterministic, dependency-free jitter source: cheap, non-cryptographic,
/// and good enough to desynchronize job ticks without pulling in `rand`.
fn pseudo_random(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    let nanos = Utc::now().timestamp_subsec_nanos() as u64;
    nanos % bound
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingJob {
        runs: Arc<AtomicU32>,
        fail_first_n: u32,
    }

    impl ScheduledJob for CountingJob {
        fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
            Box::pin(async move {
                let n = self.runs.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_first_n {
                    anyhow::bail!("simulated failure");
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn run_now_triggers_immediate_execution() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicU32::new(0));
        scheduler.register(
            "test-job",
            Duration::from_secs(3600),
            CountingJob { runs: Arc::clone(&runs), fail_first_n: 0 },
        );

        assert!(scheduler.run_now("test-job"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runs.load(Ordering::SeqCst) >= 1);
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failure_count_increments_on_error() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicU32::new(0));
        scheduler.register(
            "flaky-job",
            Duration::from_secs(3600),
            CountingJob { runs: Arc::clone(&runs), fail_first_n: 1 },
        );

        scheduler.run_now("flaky-job");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.failure_count("flaky-job"), Some(1));
        assert_eq!(scheduler.failure_counts().get("flaky-job"), Some(&1));
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn unknown_job_run_now_returns_false() {
        let scheduler = Scheduler::new();
        assert!(!scheduler.run_now("nope"));
    }
}
