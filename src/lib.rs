//! GrepWise core library
//!
//! This library contains the ingestion, indexing, search, and control-plane
//! modules that back the `grepwise-server` binary.

use std::sync::Arc;

pub mod alarm;
pub mod archive;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod listeners;
pub mod parser;
pub mod query;
pub mod record;
pub mod redactor;
pub mod retention;
pub mod scanner;
pub mod scheduler;
pub mod search;
pub mod sources;
#[cfg(test)]
mod tests;

pub use config::Config;

use alarm::AlarmEngine;
use archive::ArchiveEngine;
use buffer::IngestionBuffer;
use cache::SearchCache;
use index::IndexEngine;
use redactor::Redactor;
use retention::RetentionEngine;
use scheduler::Scheduler;
use search::SearchService;
use sources::SourceRegistry;

/// Every constructed-once core service, wired together at startup and
/// cloned cheaply (each field is an `Arc`) into every handler and worker
/// that needs it. There is no module-level mutable state anywhere in this
/// crate; everything lives here.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub buffer: Arc<IngestionBuffer>,
    pub index: Arc<IndexEngine>,
    pub cache: Arc<SearchCache>,
    pub redactor: Arc<Redactor>,
    pub search: Arc<SearchService>,
    pub sources: Arc<SourceRegistry>,
    pub alarms: Arc<AlarmEngine>,
    pub retention: Arc<RetentionEngine>,
    pub archive: Arc<ArchiveEngine>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// In-process counter snapshot (no Prometheus/OTel export, per the
    /// ambient-stack scope): `ingest.drops.total`, `intake.auth.failures`,
    /// `query.row.errors`, and `job.<name>.failures` for every registered
    /// scheduler job.
    pub fn metrics(&self) -> Metrics {
        Metrics {
            ingest_drops_total: self.buffer.drops_total(),
            intake_auth_failures: self.sources.auth_failures(),
            query_row_errors: query::row_errors_total(),
            job_failures: self.scheduler.failure_counts(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Metrics {
    pub ingest_drops_total: u64,
    pub intake_auth_failures: u64,
    pub query_row_errors: u64,
    pub job_failures: std::collections::HashMap<String, u64>,
}
