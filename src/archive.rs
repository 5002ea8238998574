//! Archive Engine: packs evicted records into gzip
//! newline-delimited-JSON containers, one file per `(source, hour bucket)`,
//! with a JSON sidecar metadata index.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GrepWiseError, GrepWiseResult};
use crate::record::LogRecord;
use crate::sources::persist_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub id: String,
    pub source: String,
    pub hour_bucket_start: i64,
    pub time_range_start: i64,
    pub time_range_end: i64,
    pub record_count: usize,
    pub compressed_bytes: usize,
    pub path: PathBuf,
    pub created_at: i64,
}

pub struct ArchiveEngine {
    root: PathBuf,
    metadata_path: PathBuf,
    metadata: RwLock<HashMap<String, ArchiveMetadata>>,
    path_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ArchiveEngine {
    pub fn open(root: PathBuf) -> GrepWiseResult<Self> {
        fs::create_dir_all(&root).map_err(GrepWiseError::from)?;
        let metadata_path = root.join("metadata.json");
        let metadata = fs::read_to_string(&metadata_path)
            .ok()
            .and_then(|s| serde_json::from_str::<Vec<ArchiveMetadata>>(&s).ok())
            .unwrap_or_default()
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        Ok(Self {
            root,
            metadata_path,
            metadata: RwLock::new(metadata),
            path_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Appends `records` (already belonging to one source and hour bucket)
    /// to that bucket's archive file, creating it if necessary. Writers to
    /// the same path serialize; concurrent writes to different paths don't
    /// block each other.
    pub fn archive(
        &self,
        source: &str,
        hour_bucket_start: i64,
        records: &[LogRecord],
    ) -> GrepWiseResult<ArchiveMetadata> {
        let path = self.bucket_path(source, hour_bucket_start);
        let path_mutex = self.path_lock_for(&path);
        let _guard = path_mutex.lock();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(GrepWiseError::from)?;
        }

        let mut existing_records = self.read_records(&path).unwrap_or_default();
        existing_records.extend_from_slice(records);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        for record in &existing_records {
            let line = serde_json::to_string(record)
                .map_err(|e| GrepWiseError::fatal(format!("archive serialize failed: {e}")))?;
            writeln!(encoder, "{line}").map_err(GrepWiseError::from)?;
        }
        let compressed = encoder.finish().map_err(GrepWiseError::from)?;
        let compressed_bytes = compressed.len();
        fs::write(&path, compressed).map_err(GrepWiseError::from)?;

        let existing_id = self
            .metadata
            .read()
            .unwrap()
            .values()
            .find(|m| m.path == path)
            .map(|m| m.id.clone());
        let id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let time_range_end = existing_records
            .iter()
            .map(LogRecord::effective_time)
            .max()
            .map(|t| t + 1)
            .unwrap_or(hour_bucket_start + 3_600_000);
        let meta = ArchiveMetadata {
            id: id.clone(),
            source: source.to_string(),
            hour_bucket_start,
            time_range_start: hour_bucket_start,
            time_range_end,
            record_count: existing_records.len(),
            compressed_bytes,
            path: path.clone(),
            created_at: crate::record::now_millis(),
        };
        self.metadata.write().unwrap().insert(id, meta.clone());
        self.persist_metadata()?;
        Ok(meta)
    }

    pub fn extract(&self, archive_id: &str) -> GrepWiseResult<Vec<LogRecord>> {
        let meta = self
            .metadata
            .read()
            .unwrap()
            .get(archive_id)
            .cloned()
            .ok_or_else(|| GrepWiseError::not_found(format!("unknown archive {archive_id}")))?;
        self.read_records(&meta.path)
    }

    pub fn delete(&self, archive_id: &str) -> GrepWiseResult<()> {
        let meta = self
            .metadata
            .write()
            .unwrap()
            .remove(archive_id)
            .ok_or_else(|| GrepWiseError::not_found(format!("unknown archive {archive_id}")))?;
        let _ = fs::remove_file(&meta.path);
        self.persist_metadata()
    }

    pub fn list(&self) -> Vec<ArchiveMetadata> {
        self.metadata.read().unwrap().values().cloned().collect()
    }

    fn read_records(&self, path: &PathBuf) -> GrepWiseResult<Vec<LogRecord>> {
        let bytes = fs::read(path).map_err(GrepWiseError::from)?;
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut content = String::new();
        decoder.read_to_string(&mut content).map_err(GrepWiseError::from)?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    fn bucket_path(&self, source: &str, hour_bucket_start: i64) -> PathBuf {
        let dt = Utc.timestamp_millis_opt(hour_bucket_start).single().unwrap_or_else(Utc::now);
        self.root
            .join(sanitize_source(source))
            .join(dt.format("%Y%m%d").to_string())
            .join(format!("{}.jsonl.gz", dt.format("%H")))
    }

    /// Returns the per-path mutex, creating it on first use. The outer map
    /// lock is held only long enough to fetch or insert the entry, so
    /// writers to different buckets never block each other.
    fn path_lock_for(&self, path: &PathBuf) -> Arc<Mutex<()>> {
        let mut locks = self.path_locks.lock();
        Arc::clone(locks.entry(path.clone()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    fn persist_metadata(&self) -> GrepWiseResult<()> {
        let snapshot: Vec<ArchiveMetadata> = self.metadata.read().unwrap().values().cloned().collect();
        persist_json_atomic(&self.metadata_path, &snapshot)
    }
}

fn sanitize_source(source: &str) -> String {
    source.chars().map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogRecordBuilder;

    #[test]
    fn archive_then_extract_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ArchiveEngine::open(dir.path().to_path_buf()).unwrap();
        let hour_start = 1625097600000;
        let records = vec![
            LogRecordBuilder::new("app", "one").message("one").build(hour_start, i64::MAX),
            LogRecordBuilder::new("app", "two").message("two").build(hour_start + 1000, i64::MAX),
        ];

        let meta = engine.archive("app", hour_start, &records).unwrap();
        assert_eq!(meta.record_count, 2);

        let extracted = engine.extract(&meta.id).unwrap();
        assert_eq!(extracted.len(), 2);
        assert_eq!(extracted[0].message, "one");
    }

    #[test]
    fn delete_removes_file_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ArchiveEngine::open(dir.path().to_path_buf()).unwrap();
        let hour_start = 1625097600000;
        let records = vec![LogRecordBuilder::new("app", "one").build(hour_start, i64::MAX)];
        let meta = engine.archive("app", hour_start, &records).unwrap();

        engine.delete(&meta.id).unwrap();
        assert!(engine.extract(&meta.id).is_err());
        assert!(!meta.path.exists());
    }

    #[test]
    fn second_archive_call_appends_to_same_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ArchiveEngine::open(dir.path().to_path_buf()).unwrap();
        let hour_start = 1625097600000;
        engine
            .archive("app", hour_start, &[LogRecordBuilder::new("app", "one").build(hour_start, i64::MAX)])
            .unwrap();
        let meta = engine
            .archive("app", hour_start, &[LogRecordBuilder::new("app", "two").build(hour_start, i64::MAX)])
            .unwrap();
        assert_eq!(meta.record_count, 2);
        assert_eq!(engine.list().len(), 1);
    }
}
