//! Bounded, thread-safe ingestion buffer.
//!
//! Any number of producers call [`IngestionBuffer::add`]/`add_all`; exactly
//! one drainer — the indexer worker — calls [`IngestionBuffer::drain`] on a
//! fixed cadence or once `size >= batch_threshold`. Overflow uses a
//! drop-newest policy: once the buffer is at capacity, new records are
//! discarded and counted rather than blocking producers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::record::LogRecord;

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_BATCH_THRESHOLD: usize = 1_024;
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(250);

/// Throttles the overflow warning to at most once per second.
struct DropWarningThrottle {
    last_logged: Mutex<Option<Instant>>,
}

impl DropWarningThrottle {
    fn new() -> Self {
        Self { last_logged: Mutex::new(None) }
    }

    fn fire(&self, total_drops: u64) {
        let mut last = self.last_logged.lock();
        let now = Instant::now();
        let should_log = match *last {
            Some(t) => now.duration_since(t) >= Duration::from_secs(1),
            None => true,
        };
        if should_log {
            tracing::warn!(total_drops, "ingestion buffer full, dropping newest records");
            *last = Some(now);
        }
    }
}

pub struct IngestionBuffer {
    capacity: usize,
    batch_threshold: usize,
    queue: Mutex<VecDeque<LogRecord>>,
    drops_total: AtomicU64,
    throttle: DropWarningThrottle,
}

impl IngestionBuffer {
    pub fn new(capacity: usize, batch_threshold: usize) -> Self {
        Self {
            capacity,
            batch_threshold,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            drops_total: AtomicU64::new(0),
            throttle: DropWarningThrottle::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_BATCH_THRESHOLD)
    }

    /// Adds one record, dropping it if the buffer is at capacity.
    /// Returns `true` if the record was accepted.
    pub fn add(&self, record: LogRecord) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            drop(queue);
            let total = self.drops_total.fetch_add(1, Ordering::Relaxed) + 1;
            self.throttle.fire(total);
            return false;
        }
        queue.push_back(record);
        true
    }

    /// Adds as many records as fit; returns the number actually accepted.
    pub fn add_all(&self, records: Vec<LogRecord>) -> usize {
        let mut accepted = 0;
        for record in records {
            if self.add(record) {
                accepted += 1;
            }
        }
        accepted
    }

    /// Removes and returns up to `max` records in FIFO order.
    pub fn drain(&self, max: usize) -> Vec<LogRecord> {
        let mut queue = self.queue.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn should_drain_now(&self) -> bool {
        self.len() >= self.batch_threshold
    }

    pub fn drops_total(&self) -> u64 {
        self.drops_total.load(Ordering::Relaxed)
    }

    pub fn batch_threshold(&self) -> usize {
        self.batch_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogRecordBuilder;

    fn record(n: u32) -> LogRecord {
        LogRecordBuilder::new("src", format!("line {n}")).build(n as i64, i64::MAX)
    }

    #[test]
    fn drains_fifo_order() {
        let buf = IngestionBuffer::new(10, 1024);
        for i in 0..5 {
            assert!(buf.add(record(i)));
        }
        let batch = buf.drain(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].ingest_time, 0);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn drops_newest_when_full_and_counts() {
        let buf = IngestionBuffer::new(2, 1024);
        assert!(buf.add(record(1)));
        assert!(buf.add(record(2)));
        assert!(!buf.add(record(3)));
        assert_eq!(buf.drops_total(), 1);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn should_drain_now_once_threshold_reached() {
        let buf = IngestionBuffer::new(100, 3);
        assert!(!buf.should_drain_now());
        for i in 0..3 {
            buf.add(record(i));
        }
        assert!(buf.should_drain_now());
    }
}
