//! Redaction layer: masks sensitive metadata keys and regex
//! matches in `message`/`rawContent` before a record leaves the search
//! surface. Configuration reloads are lock-free for readers via
//! copy-on-write (`arc_swap`).

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GrepWiseError, GrepWiseResult};
use crate::record::LogRecord;

pub const MASK: &str = "*****";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RedactionConfigFile {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

struct CompiledConfig {
    keys: HashSet<String>,
    patterns: Vec<Regex>,
    raw: RedactionConfigFile,
}

pub struct Redactor {
    path: Option<PathBuf>,
    compiled: ArcSwap<CompiledConfig>,
}

impl Redactor {
    pub fn new(config: RedactionConfigFile) -> GrepWiseResult<Self> {
        Ok(Self { path: None, compiled: ArcSwap::from_pointee(compile(config)?) })
    }

    /// Loads redaction config from a JSON file on disk; a missing file
    /// starts with an empty (no-op) configuration.
    pub fn load(path: PathBuf) -> GrepWiseResult<Self> {
        let config = fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<RedactionConfigFile>(&s).ok())
            .unwrap_or_default();
        Ok(Self { path: Some(path), compiled: ArcSwap::from_pointee(compile(config)?) })
    }

    /// Recompiles and atomically swaps in a new configuration; in-flight
    /// `redact` calls keep using the snapshot they already loaded.
    pub fn reload(&self, config: RedactionConfigFile) -> GrepWiseResult<()> {
        let compiled = compile(config)?;
        self.compiled.store(Arc::new(compiled));
        Ok(())
    }

    /// Reloads from the on-disk config path, if one was given at construction.
    pub fn reload_from_disk(&self) -> GrepWiseResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = fs::read_to_string(path).map_err(GrepWiseError::from)?;
        let config: RedactionConfigFile = serde_json::from_str(&content)
            .map_err(|e| GrepWiseError::invalid_input(format!("invalid redaction config: {e}")))?;
        self.reload(config)
    }

    pub fn current_config(&self) -> RedactionConfigFile {
        self.compiled.load().raw.clone()
    }

    /// Applies both redaction passes to a cloned record; `record` itself is
    /// left untouched so the indexed copy always retains original values.
    pub fn redact(&self, record: &LogRecord) -> LogRecord {
        let snapshot = self.compiled.load();
        let mut redacted = record.clone();

        for (key, value) in redacted.metadata.iter_mut() {
            if snapshot.keys.contains(&key.to_lowercase()) {
                *value = MASK.to_string();
            }
        }

        for pattern in &snapshot.patterns {
            redacted.message = pattern.replace_all(&redacted.message, MASK).into_owned();
            redacted.raw_content = pattern.replace_all(&redacted.raw_content, MASK).into_owned();
        }

        redacted
    }

    pub fn redact_all(&self, records: Vec<LogRecord>) -> Vec<LogRecord> {
        records.iter().map(|r| self.redact(r)).collect()
    }
}

fn compile(config: RedactionConfigFile) -> GrepWiseResult<CompiledConfig> {
    let keys = config.keys.iter().map(|k| k.to_lowercase()).collect();
    let patterns = config
        .patterns
        .iter()
        .map(|p| Regex::new(p))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GrepWiseError::invalid_input(format!("invalid redaction pattern: {e}")))?;
    Ok(CompiledConfig { keys, patterns, raw: config })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogRecordBuilder;

    #[test]
    fn masks_configured_keys_case_insensitively() {
        let redactor = Redactor::new(RedactionConfigFile {
            keys: vec!["Password".to_string(), "token".to_string()],
            patterns: vec![],
        })
        .unwrap();
        let record = LogRecordBuilder::new("s", "raw")
            .metadata("password", "secret")
            .metadata("host", "h1")
            .build(1, i64::MAX);

        let redacted = redactor.redact(&record);
        assert_eq!(redacted.metadata.get("password").unwrap(), MASK);
        assert_eq!(redacted.metadata.get("host").unwrap(), "h1");
    }

    #[test]
    fn masks_pattern_matches_in_message_and_raw_content() {
        let redactor = Redactor::new(RedactionConfigFile {
            keys: vec![],
            patterns: vec![r"\d{3}-\d{2}-\d{4}".to_string()],
        })
        .unwrap();
        let record = LogRecordBuilder::new("s", "ssn is 123-45-6789 in 123-45-6789")
            .message("ssn is 123-45-6789 in 123-45-6789")
            .build(1, i64::MAX);

        let redacted = redactor.redact(&record);
        assert_eq!(redacted.message, format!("ssn is {MASK} in {MASK}"));
        assert_eq!(redacted.raw_content, format!("ssn is {MASK} in {MASK}"));
    }

    #[test]
    fn reload_swaps_config_without_blocking_readers() {
        let redactor = Redactor::new(RedactionConfigFile::default()).unwrap();
        let record =
            LogRecordBuilder::new("s", "raw").metadata("password", "secret").build(1, i64::MAX);
        assert_eq!(redactor.redact(&record).metadata.get("password").unwrap(), "secret");

        redactor
            .reload(RedactionConfigFile { keys: vec!["password".to_string()], patterns: vec![] })
            .unwrap();
        assert_eq!(redactor.redact(&record).metadata.get("password").unwrap(), MASK);
    }
}
