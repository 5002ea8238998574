//! `LogSource` configuration and registry.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{GrepWiseError, GrepWiseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceKind {
    File,
    Syslog,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyslogProto {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyslogFormat {
    Rfc5424,
    Rfc3164,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSource {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub kind: SourceKind,

    // FILE
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub glob: Option<String>,
    #[serde(default)]
    pub recursive: bool,

    // SYSLOG
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub proto: Option<SyslogProto>,
    #[serde(default)]
    pub format: Option<SyslogFormat>,

    // HTTP
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default)]
    pub token: Option<String>,
}

/// In-memory catalog of configured sources, backed by an atomically
/// persisted `data/sources.json` snapshot.
pub struct SourceRegistry {
    path: PathBuf,
    sources: RwLock<HashMap<String, LogSource>>,
    auth_failures: AtomicU64,
}

impl SourceRegistry {
    pub fn load(path: PathBuf) -> Self {
        let sources = fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<Vec<LogSource>>(&s).ok())
            .unwrap_or_default()
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        Self { path, sources: RwLock::new(sources), auth_failures: AtomicU64::new(0) }
    }

    /// Running total of `intake.auth.failures`: unauthenticated or
    /// mistokened HTTP-intake requests against a `requireAuth` source.
    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    pub fn get(&self, id: &str) -> Option<LogSource> {
        self.sources.read().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<LogSource> {
        self.sources.read().unwrap().values().cloned().collect()
    }

    pub fn upsert(&self, source: LogSource) -> GrepWiseResult<()> {
        self.sources.write().unwrap().insert(source.id.clone(), source);
        self.persist()
    }

    pub fn delete(&self, id: &str) -> GrepWiseResult<()> {
        self.sources.write().unwrap().remove(id);
        self.persist()
    }

    /// Checks the per-source token for an HTTP-intake request: unauthenticated
    /// access to a `requireAuth` source is rejected.
    pub fn check_http_auth(&self, source_id: &str, provided_token: Option<&str>) -> GrepWiseResult<()> {
        let Some(source) = self.get(source_id) else {
            return Err(GrepWiseError::not_found(format!("unknown source {source_id}")));
        };
        if !source.require_auth {
            return Ok(());
        }
        match (source.token.as_deref(), provided_token) {
            (Some(expected), Some(got)) if expected == got => Ok(()),
            _ => {
                let total = self.auth_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(source_id, total_failures = total, "intake auth failure");
                Err(GrepWiseError::unauthorized("invalid or missing X-Auth-Token"))
            },
        }
    }

    fn persist(&self) -> GrepWiseResult<()> {
        let snapshot: Vec<LogSource> = self.sources.read().unwrap().values().cloned().collect();
        persist_json_atomic(&self.path, &snapshot)
    }
}

/// Shared temp-file+rename persistence helper used by every `data/*.json`
/// configuration snapshot.
pub fn persist_json_atomic<T: Serialize>(path: &Path, value: &T) -> GrepWiseResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(GrepWiseError::from)?;
    }
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| GrepWiseError::fatal(format!("failed to serialize {}: {e}", path.display())))?;
    fs::write(&tmp_path, bytes).map_err(GrepWiseError::from)?;
    fs::rename(&tmp_path, path).map_err(GrepWiseError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source(id: &str, require_auth: bool, token: Option<&str>) -> LogSource {
        LogSource {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            kind: SourceKind::Http,
            directory: None,
            glob: None,
            recursive: false,
            port: None,
            proto: None,
            format: None,
            require_auth,
            token: token.map(|t| t.to_string()),
        }
    }

    #[test]
    fn auth_required_source_rejects_missing_token() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::load(dir.path().join("sources.json"));
        registry.upsert(sample_source("s1", true, Some("secret"))).unwrap();
        assert!(registry.check_http_auth("s1", None).is_err());
        assert!(registry.check_http_auth("s1", Some("wrong")).is_err());
        assert!(registry.check_http_auth("s1", Some("secret")).is_ok());
        assert_eq!(registry.auth_failures(), 2);
    }

    #[test]
    fn auth_not_required_allows_any_token() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::load(dir.path().join("sources.json"));
        registry.upsert(sample_source("s2", false, None)).unwrap();
        assert!(registry.check_http_auth("s2", None).is_ok());
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.json");
        let registry = SourceRegistry::load(path.clone());
        registry.upsert(sample_source("s3", false, None)).unwrap();

        let reloaded = SourceRegistry::load(path);
        assert!(reloaded.get("s3").is_some());
    }
}
