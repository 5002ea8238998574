//! Inverted index over log records.
//!
//! Single-writer, many-readers: commits are serialized through `&self`'s
//! internal lock, while [`IndexEngine::search`] and friends read an
//! `arc_swap`-published snapshot without ever blocking on a writer.

pub mod tokenizer;

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GrepWiseError, GrepWiseResult};
use crate::record::LogRecord;
use tokenizer::tokenize;

const COMMIT_RETRY_DELAYS_MS: [u64; 3] = [100, 400, 1600];

#[derive(Debug, Serialize, Deserialize)]
enum WalOp {
    Commit { records: Vec<LogRecord> },
    DeleteOlderThan { ts: i64 },
    DeleteBySource { source: String, older_than: i64 },
    DeleteByIds { ids: Vec<String> },
}

/// An immutable, queryable view of the index, published atomically after
/// each commit so readers never observe a partial write.
#[derive(Default, Clone)]
struct Snapshot {
    records: Vec<LogRecord>,
    by_id: HashMap<String, usize>,
    by_level: HashMap<String, Vec<usize>>,
    by_source: HashMap<String, Vec<usize>>,
    tokens: HashMap<String, Vec<usize>>,
}

impl Snapshot {
    fn rebuild(records: Vec<LogRecord>) -> Self {
        let mut snapshot = Snapshot { records, ..Default::default() };
        for (idx, record) in snapshot.records.iter().enumerate() {
            snapshot.by_id.insert(record.id.clone(), idx);
            snapshot.by_level.entry(record.level.clone()).or_default().push(idx);
            snapshot.by_source.entry(record.source.clone()).or_default().push(idx);
            for token in tokenize(&record.message).into_iter().chain(tokenize(&record.raw_content))
            {
                snapshot.tokens.entry(token).or_default().push(idx);
            }
        }
        snapshot
    }
}

pub struct IndexEngine {
    dir: PathBuf,
    wal_path: PathBuf,
    snapshot: ArcSwap<Snapshot>,
    write_lock: Mutex<()>,
    on_commit: Mutex<Vec<Box<dyn Fn(i64, i64) + Send + Sync>>>,
}

impl IndexEngine {
    /// Opens (or creates) the index directory and replays its write-ahead
    /// log to reconstruct the last committed state.
    pub fn open(dir: PathBuf) -> GrepWiseResult<Self> {
        fs::create_dir_all(&dir).map_err(GrepWiseError::from)?;
        let wal_path = dir.join("wal.jsonl");

        let mut records: Vec<LogRecord> = Vec::new();
        if let Ok(content) = fs::read_to_string(&wal_path) {
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WalOp>(line) {
                    Ok(WalOp::Commit { records: batch }) => records.extend(batch),
                    Ok(WalOp::DeleteOlderThan { ts }) => {
                        records.retain(|r| r.effective_time() >= ts)
                    },
                    Ok(WalOp::DeleteBySource { source, older_than }) => {
                        records.retain(|r| !(r.source == source && r.effective_time() < older_than))
                    },
                    Ok(WalOp::DeleteByIds { ids }) => {
                        let ids: std::collections::HashSet<String> = ids.into_iter().collect();
                        records.retain(|r| !ids.contains(&r.id))
                    },
                    Err(err) => tracing::warn!(%err, "skipping corrupt WAL line on replay"),
                }
            }
        }

        Ok(Self {
            dir,
            wal_path,
            snapshot: ArcSwap::from_pointee(Snapshot::rebuild(records)),
            write_lock: Mutex::new(()),
            on_commit: Mutex::new(Vec::new()),
        })
    }

    /// Registers a callback invoked after every commit/delete with the time
    /// range it affected, used by the Search Cache to invalidate
    /// intersecting entries.
    pub fn on_commit(&self, callback: impl Fn(i64, i64) + Send + Sync + 'static) {
        self.on_commit.lock().push(Box::new(callback));
    }

    fn notify_commit(&self, start: i64, end: i64) {
        for cb in self.on_commit.lock().iter() {
            cb(start, end);
        }
    }

    /// Atomically commits a batch; after this returns, `search` observes
    /// every record in `batch`. Retries transient I/O failures with
    /// exponential backoff before quarantining the batch.
    pub async fn index(&self, batch: Vec<LogRecord>) -> GrepWiseResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let op = WalOp::Commit { records: batch };
        self.append_wal_with_retry(&op).await?;

        let WalOp::Commit { records } = op else { unreachable!() };
        let (min_t, max_t) = time_range(&records);
        {
            let _guard = self.write_lock.lock();
            let mut merged = self.snapshot.load().records.clone();
            merged.extend(records);
            self.snapshot.store(Arc::new(Snapshot::rebuild(merged)));
        }
        self.notify_commit(min_t, max_t);
        Ok(())
    }

    async fn append_wal_with_retry(&self, op: &WalOp) -> GrepWiseResult<()> {
        let mut last_err = None;
        for (attempt, delay_ms) in COMMIT_RETRY_DELAYS_MS.iter().enumerate() {
            match self.append_wal(op) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "index commit I/O failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                },
            }
        }
        match self.append_wal(op) {
            Ok(()) => Ok(()),
            Err(err) => {
                last_err = Some(err);
                self.quarantine(op);
                Err(GrepWiseError::fatal(format!(
                    "index commit exhausted retry budget: {}",
                    last_err.unwrap()
                )))
            },
        }
    }

    fn append_wal(&self, op: &WalOp) -> std::io::Result<()> {
        let line = serde_json::to_string(op)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.wal_path)?;
        writeln!(file, "{line}")?;
        file.sync_all()
    }

    fn quarantine(&self, op: &WalOp) {
        let dir = self.dir.join("quarantine");
        if fs::create_dir_all(&dir).is_err() {
            return;
        }
        let file_name = format!("{}-{}.jsonl", crate::record::now_millis(), uuid::Uuid::new_v4());
        if let Ok(line) = serde_json::to_string(op) {
            let _ = fs::write(dir.join(file_name), line);
        }
        tracing::error!("index batch quarantined after exhausting commit retry budget");
    }

    pub fn find_by_id(&self, id: &str) -> Option<LogRecord> {
        let snapshot = self.snapshot.load();
        snapshot.by_id.get(id).map(|&idx| snapshot.records[idx].clone())
    }

    pub fn find_by_level(&self, level: &str) -> Vec<LogRecord> {
        let snapshot = self.snapshot.load();
        snapshot
            .by_level
            .get(level)
            .map(|idxs| idxs.iter().map(|&i| snapshot.records[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn find_by_source(&self, source: &str) -> Vec<LogRecord> {
        let snapshot = self.snapshot.load();
        snapshot
            .by_source
            .get(source)
            .map(|idxs| idxs.iter().map(|&i| snapshot.records[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Full-text/regex search over the pre-filtered time window. `*`, empty
    /// or `None` queries match all. Results are ordered newest-first by
    /// effective time, ties broken by `id` ascending.
    pub fn search(
        &self,
        query: Option<&str>,
        is_regex: bool,
        start_time: i64,
        end_time: i64,
    ) -> GrepWiseResult<Vec<LogRecord>> {
        let snapshot = self.snapshot.load();
        let is_match_all = matches!(query.map(str::trim), None | Some("") | Some("*"));

        let mut candidate_indices: Vec<usize> = if is_match_all {
            (0..snapshot.records.len()).collect()
        } else if is_regex {
            let pattern = query.unwrap();
            let re = Regex::new(pattern)
                .map_err(|e| GrepWiseError::invalid_input(format!("invalid regex: {e}")))?;
            (0..snapshot.records.len())
                .filter(|&idx| {
                    let r = &snapshot.records[idx];
                    re.is_match(&r.message) || re.is_match(&r.raw_content)
                })
                .collect()
        } else {
            let tokens = tokenize(query.unwrap());
            if tokens.is_empty() {
                (0..snapshot.records.len()).collect()
            } else {
                tokens
                    .iter()
                    .flat_map(|t| snapshot.tokens.get(t).cloned().unwrap_or_default())
                    .collect::<std::collections::HashSet<_>>()
                    .into_iter()
                    .filter(|&idx| {
                        let needle = query.unwrap().to_lowercase();
                        let r = &snapshot.records[idx];
                        r.message.to_lowercase().contains(&needle)
                            || r.raw_content.to_lowercase().contains(&needle)
                    })
                    .collect()
            }
        };

        candidate_indices.retain(|&idx| {
            let t = snapshot.records[idx].effective_time();
            t >= start_time && t < end_time
        });

        let mut results: Vec<LogRecord> =
            candidate_indices.into_iter().map(|idx| snapshot.records[idx].clone()).collect();
        results.sort_by(|a, b| {
            b.effective_time().cmp(&a.effective_time()).then_with(|| a.id.cmp(&b.id))
        });
        Ok(results)
    }

    pub async fn delete_older_than(&self, ts: i64) -> GrepWiseResult<usize> {
        let before = self.snapshot.load().records.len();
        let op = WalOp::DeleteOlderThan { ts };
        self.append_wal_with_retry(&op).await?;
        {
            let _guard = self.write_lock.lock();
            let mut remaining = self.snapshot.load().records.clone();
            remaining.retain(|r| r.effective_time() >= ts);
            self.snapshot.store(Arc::new(Snapshot::rebuild(remaining)));
        }
        let after = self.snapshot.load().records.len();
        self.notify_commit(i64::MIN, ts);
        Ok(before - after)
    }

    pub async fn delete_by_source(&self, source: &str, older_than: i64) -> GrepWiseResult<usize> {
        let before = self.snapshot.load().records.len();
        let op = WalOp::DeleteBySource { source: source.to_string(), older_than };
        self.append_wal_with_retry(&op).await?;
        {
            let _guard = self.write_lock.lock();
            let mut remaining = self.snapshot.load().records.clone();
            remaining.retain(|r| !(r.source == source && r.effective_time() < older_than));
            self.snapshot.store(Arc::new(Snapshot::rebuild(remaining)));
        }
        let after = self.snapshot.load().records.len();
        self.notify_commit(i64::MIN, older_than);
        Ok(before - after)
    }

    /// Deletes specific records by id, regardless of age — used by
    /// count-based retention to trim a scope down to its newest N records.
    pub async fn delete_by_ids(&self, ids: &[String]) -> GrepWiseResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let before = self.snapshot.load().records.len();
        let op = WalOp::DeleteByIds { ids: ids.to_vec() };
        self.append_wal_with_retry(&op).await?;
        let id_set: std::collections::HashSet<&String> = ids.iter().collect();
        let (min_t, max_t) = {
            let _guard = self.write_lock.lock();
            let snapshot = self.snapshot.load();
            let (min_t, max_t) = snapshot
                .records
                .iter()
                .filter(|r| id_set.contains(&r.id))
                .map(LogRecord::effective_time)
                .fold((i64::MAX, i64::MIN), |(lo, hi), t| (lo.min(t), hi.max(t)));
            let mut remaining = snapshot.records.clone();
            remaining.retain(|r| !id_set.contains(&r.id));
            self.snapshot.store(Arc::new(Snapshot::rebuild(remaining)));
            (min_t, max_t)
        };
        let after = self.snapshot.load().records.len();
        if after < before {
            self.notify_commit(min_t, max_t.saturating_add(1));
        }
        Ok(before - after)
    }

    pub fn record_count(&self) -> usize {
        self.snapshot.load().records.len()
    }

    /// Rewrites the WAL to hold exactly the current snapshot as a single
    /// commit op, bounding its on-disk growth. Safe to call at any time;
    /// concurrent readers are unaffected.
    pub fn compact(&self) -> GrepWiseResult<()> {
        let _guard = self.write_lock.lock();
        let records = self.snapshot.load().records.clone();
        let op = WalOp::Commit { records };
        let tmp_path = self.wal_path.with_extension("compact.tmp");
        let line = serde_json::to_string(&op)
            .map_err(|e| GrepWiseError::fatal(format!("compact serialize failed: {e}")))?;
        fs::write(&tmp_path, format!("{line}\n")).map_err(GrepWiseError::from)?;
        fs::rename(&tmp_path, &self.wal_path).map_err(GrepWiseError::from)
    }
}

fn time_range(records: &[LogRecord]) -> (i64, i64) {
    let min = records.iter().map(LogRecord::effective_time).min().unwrap_or(i64::MIN);
    let max = records.iter().map(LogRecord::effective_time).max().unwrap_or(i64::MAX);
    (min, max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogRecordBuilder;

    fn rec(source: &str, message: &str, effective: i64) -> LogRecord {
        LogRecordBuilder::new(source, message).record_time(Some(effective)).message(message).build(effective, i64::MAX)
    }

    #[tokio::test]
    async fn search_honors_time_window_and_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let engine = IndexEngine::open(dir.path().to_path_buf()).unwrap();
        engine
            .index(vec![
                rec("s", "alpha ERROR", 1625097600000),
                rec("s", "beta INFO", 1625097660000),
                rec("s", "alpha WARN", 1625097720000),
            ])
            .await
            .unwrap();

        let results = engine.search(Some("alpha"), false, 1625097600000, 1625097800000).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].message, "alpha WARN");
        assert_eq!(results[1].message, "alpha ERROR");
    }

    #[tokio::test]
    async fn match_all_query_returns_everything_in_window() {
        let dir = tempfile::tempdir().unwrap();
        let engine = IndexEngine::open(dir.path().to_path_buf()).unwrap();
        engine.index(vec![rec("s", "one", 100), rec("s", "two", 200)]).await.unwrap();

        let star = engine.search(Some("*"), false, 0, 1000).unwrap();
        let empty = engine.search(Some(""), false, 0, 1000).unwrap();
        let none = engine.search(None, false, 0, 1000).unwrap();
        assert_eq!(star.len(), 2);
        assert_eq!(empty.len(), 2);
        assert_eq!(none.len(), 2);
    }

    #[tokio::test]
    async fn regex_equivalent_to_literal_for_plain_strings() {
        let dir = tempfile::tempdir().unwrap();
        let engine = IndexEngine::open(dir.path().to_path_buf()).unwrap();
        engine.index(vec![rec("s", "connection refused", 100)]).await.unwrap();

        let literal = engine.search(Some("refused"), false, 0, 1000).unwrap();
        let regex = engine.search(Some("refused"), true, 0, 1000).unwrap();
        assert_eq!(literal.len(), regex.len());
        assert_eq!(literal[0].id, regex[0].id);
    }

    #[tokio::test]
    async fn delete_older_than_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = IndexEngine::open(dir.path().to_path_buf()).unwrap();
        engine.index(vec![rec("s", "old", 100), rec("s", "new", 9999)]).await.unwrap();

        let first = engine.delete_older_than(1000).await.unwrap();
        assert_eq!(first, 1);
        let second = engine.delete_older_than(1000).await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(engine.record_count(), 1);
    }

    #[tokio::test]
    async fn delete_by_ids_removes_only_named_records() {
        let dir = tempfile::tempdir().unwrap();
        let engine = IndexEngine::open(dir.path().to_path_buf()).unwrap();
        engine.index(vec![rec("s", "keep", 100), rec("s", "drop", 200)]).await.unwrap();

        let drop_id = engine.search(Some("drop"), false, 0, 1000).unwrap()[0].id.clone();
        let deleted = engine.delete_by_ids(&[drop_id]).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(engine.record_count(), 1);
        assert_eq!(engine.search(None, false, 0, 1000).unwrap()[0].message, "keep");
    }

    #[tokio::test]
    async fn replays_wal_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = IndexEngine::open(dir.path().to_path_buf()).unwrap();
            engine.index(vec![rec("s", "persisted", 100)]).await.unwrap();
        }
        let reopened = IndexEngine::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.record_count(), 1);
    }
}
