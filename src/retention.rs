//! Retention Engine: per-policy scheduled eviction, archiving
//! evicted records first when enabled for the source.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveEngine;
use crate::cache::SearchCache;
use crate::error::{GrepWiseError, GrepWiseResult};
use crate::index::IndexEngine;
use crate::record::LogRecord;
use crate::sources::persist_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default = "new_policy_id")]
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub source: Option<String>,
    pub max_age_ms: i64,
    /// Caps the policy's scope (global, or the `source` it names) to its N
    /// newest records by effective time; the remainder is deleted after
    /// the age-based pass, archived first when `archive_before_delete`.
    #[serde(default)]
    pub max_records: Option<usize>,
    pub archive_before_delete: bool,
}

fn new_policy_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_enabled() -> bool {
    true
}

pub struct RetentionEngine {
    index: Arc<IndexEngine>,
    cache: Arc<SearchCache>,
    archive: Arc<ArchiveEngine>,
    path: PathBuf,
    policies: RwLock<Vec<RetentionPolicy>>,
}

impl RetentionEngine {
    pub fn load(
        path: PathBuf,
        index: Arc<IndexEngine>,
        cache: Arc<SearchCache>,
        archive: Arc<ArchiveEngine>,
    ) -> Self {
        let policies = fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<Vec<RetentionPolicy>>(&s).ok())
            .unwrap_or_default();
        Self { index, cache, archive, path, policies: RwLock::new(policies) }
    }

    pub fn set_policies(&self, policies: Vec<RetentionPolicy>) -> GrepWiseResult<()> {
        *self.policies.write().unwrap() = policies.clone();
        persist_json_atomic(&self.path, &policies)
    }

    pub fn policies(&self) -> Vec<RetentionPolicy> {
        self.policies.read().unwrap().clone()
    }

    /// Runs every configured policy once. Idempotent: a second run against
    /// the same `now` yields zero further deletions because already-evicted
    /// records no longer satisfy the cutoff.
    pub async fn run_once(&self, now: i64) -> GrepWiseResult<usize> {
        let policies = self.policies();
        let mut total_deleted = 0;
        for policy in policies {
            if !policy.enabled {
                continue;
            }
            total_deleted += self.apply_policy(&policy, now).await?;
        }
        Ok(total_deleted)
    }

    async fn apply_policy(&self, policy: &RetentionPolicy, now: i64) -> GrepWiseResult<usize> {
        let cutoff = now - policy.max_age_ms;

        if policy.archive_before_delete {
            let expired: Vec<LogRecord> = self.scope(policy).into_iter().filter(|r| r.effective_time() < cutoff).collect();
            self.archive_records(&expired)?;
        }

        let mut deleted = match &policy.source {
            Some(source) => self.index.delete_by_source(source, cutoff).await?,
            None => self.index.delete_older_than(cutoff).await?,
        };
        if deleted > 0 {
            self.cache.invalidate_intersecting(i64::MIN, cutoff);
            tracing::info!(
                policy = %policy.id,
                source = policy.source.as_deref().unwrap_or("*"),
                deleted,
                cutoff,
                "retention deleted records"
            );
        }

        deleted += self.apply_max_records(policy).await?;
        Ok(deleted)
    }

    /// Retains only the `max_records` newest records (by effective time) in
    /// the policy's scope, archiving then deleting the rest.
    async fn apply_max_records(&self, policy: &RetentionPolicy) -> GrepWiseResult<usize> {
        let Some(max_records) = policy.max_records else {
            return Ok(0);
        };

        let mut scoped = self.scope(policy);
        if scoped.len() <= max_records {
            return Ok(0);
        }
        scoped.sort_by(|a, b| b.effective_time().cmp(&a.effective_time()).then_with(|| b.id.cmp(&a.id)));
        let overflow = scoped.split_off(max_records);

        if policy.archive_before_delete {
            self.archive_records(&overflow)?;
        }

        let (min_t, max_t) = overflow
            .iter()
            .map(LogRecord::effective_time)
            .fold((i64::MAX, i64::MIN), |(lo, hi), t| (lo.min(t), hi.max(t)));
        let ids: Vec<String> = overflow.into_iter().map(|r| r.id).collect();
        let deleted = self.index.delete_by_ids(&ids).await?;
        if deleted > 0 {
            self.cache.invalidate_intersecting(min_t, max_t.saturating_add(1));
            tracing::info!(
                policy = %policy.id,
                source = policy.source.as_deref().unwrap_or("*"),
                deleted,
                max_records,
                "retention trimmed records beyond max_records"
            );
        }
        Ok(deleted)
    }

    /// The full set of records a policy applies to: a single source, or the
    /// whole store when unscoped.
    fn scope(&self, policy: &RetentionPolicy) -> Vec<LogRecord> {
        match &policy.source {
            Some(source) => self.index.find_by_source(source),
            None => self.index.search(None, false, i64::MIN, i64::MAX).unwrap_or_default(),
        }
    }

    fn archive_records(&self, records: &[LogRecord]) -> GrepWiseResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut by_bucket: HashMap<(String, i64), Vec<LogRecord>> = HashMap::new();
        for record in records {
            let hour_bucket = record.effective_time() - (record.effective_time() % 3_600_000);
            by_bucket.entry((record.source.clone(), hour_bucket)).or_default().push(record.clone());
        }

        for ((source, hour_bucket), records) in by_bucket {
            self.archive.archive(&source, hour_bucket, &records).map_err(|e| {
                GrepWiseError::fatal(format!("pre-deletion archive failed for {source}: {e}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::record::LogRecordBuilder;

    async fn harness() -> (tempfile::TempDir, RetentionEngine) {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(IndexEngine::open(dir.path().join("index")).unwrap());
        let cache = Arc::new(SearchCache::new(CacheConfig::default()));
        let archive = Arc::new(ArchiveEngine::open(dir.path().join("archives")).unwrap());
        let engine = RetentionEngine::load(dir.path().join("retention.json"), index, cache, archive);
        (dir, engine)
    }

    #[tokio::test]
    async fn deletes_records_older_than_policy_and_is_idempotent() {
        let (_dir, engine) = harness().await;
        engine
            .index
            .index(vec![
                LogRecordBuilder::new("app", "old").record_time(Some(1000)).build(1000, i64::MAX),
                LogRecordBuilder::new("app", "new").record_time(Some(9_000_000)).build(9_000_000, i64::MAX),
            ])
            .await
            .unwrap();
        engine
            .set_policies(vec![RetentionPolicy {
                id: "age-policy".to_string(),
                enabled: true,
                source: None,
                max_age_ms: 1_000_000,
                max_records: None,
                archive_before_delete: false,
            }])
            .unwrap();

        let first = engine.run_once(2_000_000).await.unwrap();
        assert_eq!(first, 1);
        let second = engine.run_once(2_000_000).await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn archives_before_deleting_when_enabled() {
        let (_dir, engine) = harness().await;
        engine
            .index
            .index(vec![LogRecordBuilder::new("app", "old").record_time(Some(1000)).build(1000, i64::MAX)])
            .await
            .unwrap();
        engine
            .set_policies(vec![RetentionPolicy {
                id: "archive-policy".to_string(),
                enabled: true,
                source: Some("app".to_string()),
                max_age_ms: 500,
                max_records: None,
                archive_before_delete: true,
            }])
            .unwrap();

        let deleted = engine.run_once(2000).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(engine.archive.list().len(), 1);
    }

    #[tokio::test]
    async fn disabled_policy_is_skipped() {
        let (_dir, engine) = harness().await;
        engine
            .index
            .index(vec![LogRecordBuilder::new("app", "old").record_time(Some(1000)).build(1000, i64::MAX)])
            .await
            .unwrap();
        engine
            .set_policies(vec![RetentionPolicy {
                id: "disabled-policy".to_string(),
                enabled: false,
                source: None,
                max_age_ms: 500,
                max_records: None,
                archive_before_delete: false,
            }])
            .unwrap();

        let deleted = engine.run_once(2000).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(engine.index.record_count(), 1);
    }

    #[tokio::test]
    async fn max_records_trims_to_newest_n_and_is_idempotent() {
        let (_dir, engine) = harness().await;
        engine
            .index
            .index(vec![
                LogRecordBuilder::new("app", "one").record_time(Some(1000)).build(1000, i64::MAX),
                LogRecordBuilder::new("app", "two").record_time(Some(2000)).build(2000, i64::MAX),
                LogRecordBuilder::new("app", "three").record_time(Some(3000)).build(3000, i64::MAX),
            ])
            .await
            .unwrap();
        engine
            .set_policies(vec![RetentionPolicy {
                id: "max-records-policy".to_string(),
                enabled: true,
                source: Some("app".to_string()),
                max_age_ms: 1_000_000_000,
                max_records: Some(2),
                archive_before_delete: true,
            }])
            .unwrap();

        let deleted = engine.run_once(4000).await.unwrap();
        assert_eq!(deleted, 1);
        let remaining = engine.index.find_by_source("app");
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|r| r.message != "one"));
        assert_eq!(engine.archive.list().len(), 1);

        let second = engine.run_once(4000).await.unwrap();
        assert_eq!(second, 0);
    }
}
