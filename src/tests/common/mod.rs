//! Shared test fixtures: wires the same components `main.rs` wires,
//! against a temp directory, for scenarios that span more than one
//! component.

use std::sync::Arc;

use tempfile::TempDir;

use crate::archive::ArchiveEngine;
use crate::cache::{CacheConfig, SearchCache};
use crate::index::IndexEngine;
use crate::record::LogRecordBuilder;
use crate::redactor::{RedactionConfigFile, Redactor};
use crate::retention::RetentionEngine;
use crate::search::SearchService;

/// A fully wired core, minus listeners/scheduler, over a throwaway
/// directory tree. Mirrors the construction order in `main.rs`.
pub struct Harness {
    pub _dir: TempDir,
    pub index: Arc<IndexEngine>,
    pub cache: Arc<SearchCache>,
    pub search: Arc<SearchService>,
    pub retention: Arc<RetentionEngine>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(IndexEngine::open(dir.path().join("index")).unwrap());
        let cache = Arc::new(SearchCache::new(CacheConfig::default()));
        {
            let cache = Arc::clone(&cache);
            index.on_commit(move |start, end| cache.invalidate_intersecting(start, end));
        }
        let redactor = Arc::new(Redactor::new(RedactionConfigFile::default()).unwrap());
        let search =
            Arc::new(SearchService::new(Arc::clone(&index), Arc::clone(&cache), redactor));
        let archive = Arc::new(ArchiveEngine::open(dir.path().join("archive")).unwrap());
        let retention = Arc::new(RetentionEngine::load(
            dir.path().join("retention.json"),
            Arc::clone(&index),
            Arc::clone(&cache),
            archive,
        ));

        Self { _dir: dir, index, cache, search, retention }
    }
}

pub fn record(source: &str, message: &str, record_time: i64) -> crate::record::LogRecord {
    LogRecordBuilder::new(source, message)
        .message(message)
        .record_time(Some(record_time))
        .build(record_time, i64::MAX)
}
