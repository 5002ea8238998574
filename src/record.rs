//! Canonical log record type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable, indexable log entry.
///
/// Invariants: `id` and `source` are never empty; `ingest_time` is assigned
/// by the system at intake and is never parsed from the payload;
/// `record_time`, when present, must satisfy
/// `record_time <= ingest_time + clock_skew_budget_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub ingest_time: i64,
    pub record_time: Option<i64>,
    pub level: String,
    pub message: String,
    pub source: String,
    pub metadata: BTreeMap<String, String>,
    pub raw_content: String,
}

impl LogRecord {
    /// `recordTime ?? ingestTime`, the ordering/bucketing key used
    /// everywhere in the Index Engine and Search Service.
    pub fn effective_time(&self) -> i64 {
        self.record_time.unwrap_or(self.ingest_time)
    }
}

/// Builds a `LogRecord`, assigning `id`/`ingest_time` the way every parser
/// (component A) and the Index Engine expect: the system owns these two
/// fields, never the input payload.
pub struct LogRecordBuilder {
    record_time: Option<i64>,
    level: String,
    message: String,
    source: String,
    metadata: BTreeMap<String, String>,
    raw_content: String,
}

impl LogRecordBuilder {
    pub fn new(source: impl Into<String>, raw_content: impl Into<String>) -> Self {
        Self {
            record_time: None,
            level: "UNKNOWN".to_string(),
            message: String::new(),
            source: source.into(),
            metadata: BTreeMap::new(),
            raw_content: raw_content.into(),
        }
    }

    pub fn record_time(mut self, ts: Option<i64>) -> Self {
        self.record_time = ts;
        self
    }

    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata_map(mut self, map: BTreeMap<String, String>) -> Self {
        self.metadata.extend(map);
        self
    }

    /// Clamp `record_time` to the clock-skew budget and stamp `ingest_time`.
    pub fn build(self, ingest_time: i64, clock_skew_budget_ms: i64) -> LogRecord {
        let record_time = self.record_time.filter(|ts| *ts <= ingest_time + clock_skew_budget_ms);
        LogRecord {
            id: Uuid::new_v4().to_string(),
            ingest_time,
            record_time,
            level: self.level,
            message: if self.message.is_empty() { self.raw_content.clone() } else { self.message },
            source: self.source,
            metadata: self.metadata,
            raw_content: self.raw_content,
        }
    }
}

/// Current time in milliseconds since epoch; the single clock source used
/// to stamp `ingest_time` so all components agree on "now".
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
