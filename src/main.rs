//! `grepwise-server`: wires the core services together (§9 "constructed
//! once" singletons) and runs the ingestion surfaces and background
//! control loops described in spec §2 and §5.
//!
//! REST query/alarm/dashboard bindings are an external collaborator layer
//! (spec §1 out-of-scope) built against [`grepwise_core::AppState`]; this
//! binary only stands up the parts spec §2 calls the core: listeners, the
//! indexer worker, and the retention/archive/alarm/cache scheduler jobs.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use grepwise_core::alarm::AlarmEngine;
use grepwise_core::archive::ArchiveEngine;
use grepwise_core::buffer::IngestionBuffer;
use grepwise_core::cache::{CacheConfig, SearchCache};
use grepwise_core::config::Config;
use grepwise_core::index::IndexEngine;
use grepwise_core::listeners::http_intake::HttpIntakeListener;
use grepwise_core::listeners::syslog_tcp::SyslogTcpListener;
use grepwise_core::listeners::syslog_udp::SyslogUdpListener;
use grepwise_core::listeners::Listener;
use grepwise_core::record::now_millis;
use grepwise_core::redactor::Redactor;
use grepwise_core::retention::RetentionEngine;
use grepwise_core::scanner::{FileScanner, ScannerSourceConfig};
use grepwise_core::scheduler::{ScheduledJob, Scheduler};
use grepwise_core::search::SearchService;
use grepwise_core::sources::{SourceRegistry, SyslogFormat};
use grepwise_core::AppState;

/// Adapts a `Fn() -> Future` closure into a [`ScheduledJob`] so each
/// control loop below can be registered as a one-liner instead of a
/// bespoke struct.
struct FnJob<F>(F);

impl<F, Fut> ScheduledJob for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin((self.0)())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(&config);

    tracing::info!("GrepWise core starting up");

    std::fs::create_dir_all(&config.index.dir)?;
    std::fs::create_dir_all(&config.archive.dir)?;
    std::fs::create_dir_all("data")?;

    let index = Arc::new(IndexEngine::open(PathBuf::from(&config.index.dir))?);
    let cache = Arc::new(SearchCache::new(CacheConfig {
        enabled: config.cache.enabled,
        max_size: config.cache.max_size,
        expiration_ms: config.cache.ttl_ms as i64,
    }));
    {
        // Keeps the cache-consistency invariant (spec §8): any commit or
        // deletion invalidates the entries whose window it touched.
        let cache = Arc::clone(&cache);
        index.on_commit(move |start, end| cache.invalidate_intersecting(start, end));
    }

    let redactor = Arc::new(match &config.redaction.config_path {
        Some(path) => Redactor::load(PathBuf::from(path))?,
        None => Redactor::new(Default::default())?,
    });

    let search =
        Arc::new(SearchService::new(Arc::clone(&index), Arc::clone(&cache), Arc::clone(&redactor)));
    let sources = Arc::new(SourceRegistry::load(PathBuf::from("data/sources.json")));
    let archive = Arc::new(ArchiveEngine::open(PathBuf::from(&config.archive.dir))?);
    let retention = Arc::new(RetentionEngine::load(
        PathBuf::from(&config.retention.state_path),
        Arc::clone(&index),
        Arc::clone(&cache),
        Arc::clone(&archive),
    ));
    let alarms =
        Arc::new(AlarmEngine::load(PathBuf::from(&config.alarm.state_path), Arc::clone(&search)));
    let buffer = Arc::new(IngestionBuffer::new(
        config.ingestion.buffer_capacity,
        config.ingestion.buffer_batch_threshold,
    ));
    let scheduler = Arc::new(Scheduler::new());

    let state = AppState {
        config: Arc::new(config.clone()),
        buffer: Arc::clone(&buffer),
        index: Arc::clone(&index),
        cache: Arc::clone(&cache),
        redactor: Arc::clone(&redactor),
        search: Arc::clone(&search),
        sources: Arc::clone(&sources),
        alarms: Arc::clone(&alarms),
        retention: Arc::clone(&retention),
        archive: Arc::clone(&archive),
        scheduler: Arc::clone(&scheduler),
    };

    register_indexer_worker(&state);
    register_scanner(&state);
    register_retention(&state);
    register_alarm_eval(&state);
    register_cache_sweep(&state);

    let mut listeners: Vec<Arc<dyn Listener>> = Vec::new();

    if state.config.syslog.enabled {
        let format = match state.config.syslog.format.to_uppercase().as_str() {
            "RFC3164" => SyslogFormat::Rfc3164,
            _ => SyslogFormat::Rfc5424,
        };
        let port = state.config.syslog.port;
        let listener: Arc<dyn Listener> = match state.config.syslog.proto.to_uppercase().as_str() {
            "TCP" => Arc::new(SyslogTcpListener::new(port, format, Arc::clone(&state.buffer))),
            _ => Arc::new(SyslogUdpListener::new(port, format, Arc::clone(&state.buffer))),
        };
        listener.start().await?;
        tracing::info!(port, proto = %state.config.syslog.proto, format = %state.config.syslog.format, "syslog listener started");
        listeners.push(listener);
    }

    let http_listener: Arc<dyn Listener> = Arc::new(HttpIntakeListener::new(
        state.config.server.host.clone(),
        state.config.server.port,
        Arc::clone(&state.buffer),
        Arc::clone(&state.sources),
    ));
    http_listener.start().await?;
    tracing::info!(
        host = %state.config.server.host,
        port = state.config.server.port,
        "HTTP intake receiver listening"
    );
    listeners.push(http_listener);

    tracing::info!("GrepWise is ready to ingest");
    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining workers");

    for listener in &listeners {
        if let Err(err) = listener.stop().await {
            tracing::warn!(%err, "listener did not stop cleanly");
        }
    }
    scheduler.shutdown(Duration::from_secs(5)).await;

    Ok(())
}

/// The single indexer worker (spec §4.B, §5): drains the ingestion buffer
/// on `drain_interval_ms` and commits each batch as one atomic write.
fn register_indexer_worker(state: &AppState) {
    let buffer = Arc::clone(&state.buffer);
    let index = Arc::clone(&state.index);
    let drain_size = state.config.ingestion.buffer_capacity;
    state.scheduler.register(
        "indexer-drain",
        Duration::from_millis(state.config.ingestion.drain_interval_ms),
        FnJob(move || {
            let buffer = Arc::clone(&buffer);
            let index = Arc::clone(&index);
            async move {
                let batch = buffer.drain(drain_size);
                if !batch.is_empty() {
                    index.index(batch).await?;
                }
                Ok(())
            }
        }),
    );
}

/// The file scanner (spec §4.C), registered only when at least one
/// directory is configured.
fn register_scanner(state: &AppState) {
    let configured: Vec<ScannerSourceConfig> = state
        .config
        .ingestion
        .log_dirs
        .iter()
        .map(|d| ScannerSourceConfig {
            directory: PathBuf::from(&d.directory),
            glob: d.glob.clone(),
            recursive: d.recursive,
        })
        .collect();
    if configured.is_empty() {
        return;
    }

    let scanner = Arc::new(FileScanner::new(
        configured,
        PathBuf::from("data/scanner_offsets.json"),
        Arc::clone(&state.buffer),
    ));
    state.scheduler.register(
        "file-scanner",
        Duration::from_secs(state.config.ingestion.scan_period_secs),
        FnJob(move || {
            let scanner = Arc::clone(&scanner);
            async move {
                scanner.scan_all();
                Ok(())
            }
        }),
    );
}

/// The retention control loop (spec §4.I): evicts (and, per policy,
/// archives) records past their cutoff on every tick.
fn register_retention(state: &AppState) {
    let retention = Arc::clone(&state.retention);
    state.scheduler.register(
        "retention",
        Duration::from_secs(state.config.retention.run_period_secs),
        FnJob(move || {
            let retention = Arc::clone(&retention);
            async move {
                let deleted = retention.run_once(now_millis()).await?;
                if deleted > 0 {
                    tracing::info!(deleted, "retention sweep evicted records");
                }
                Ok(())
            }
        }),
    );
}

/// The alarm evaluation loop (spec §4.K step 1): wakes at
/// `min(eval_period_secs, 30s)` and ticks every enabled alarm.
fn register_alarm_eval(state: &AppState) {
    let alarms = Arc::clone(&state.alarms);
    let period = Duration::from_secs(state.config.alarm.eval_period_secs.min(30).max(1));
    state.scheduler.register(
        "alarm-eval",
        period,
        FnJob(move || {
            let alarms = Arc::clone(&alarms);
            async move {
                alarms.tick_all(now_millis()).await;
                Ok(())
            }
        }),
    );
}

/// The cache sweep (spec §4.G): entries are also swept proactively every
/// `ttl_ms / 4`, on top of the lazy invalidation `SearchCache::get` does.
fn register_cache_sweep(state: &AppState) {
    let cache = Arc::clone(&state.cache);
    let period = Duration::from_millis((state.config.cache.ttl_ms / 4).max(1_000));
    state.scheduler.register(
        "cache-sweep",
        period,
        FnJob(move || {
            let cache = Arc::clone(&cache);
            async move {
                cache.sweep(now_millis());
                Ok(())
            }
        }),
    );
}

fn init_tracing(config: &Config) {
    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("grepwise.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leaked deliberately: the guard must outlive the process for the
        // non-blocking writer to flush, and the process only exits at
        // shutdown anyway.
        Box::leak(Box::new(guard));
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
