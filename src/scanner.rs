//! File scanner: tails configured directories and feeds the parser.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use glob::Pattern;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::buffer::IngestionBuffer;
use crate::parser::raw_line::RawLineParser;
use crate::parser::{self, Parser, DEFAULT_CLOCK_SKEW_BUDGET_MS};

pub const DEFAULT_SCAN_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ScannerSourceConfig {
    pub directory: PathBuf,
    pub glob: String,
    pub recursive: bool,
}

/// `path -> (inode, byte offset)`, persisted so a restart does not
/// re-ingest whole files.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct OffsetMap(HashMap<String, (u64, u64)>);

impl OffsetMap {
    pub fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Atomically persists the offset map via temp-file + rename.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(&self.0)?)?;
        fs::rename(&tmp_path, path)
    }
}

pub struct FileScanner {
    sources: Vec<ScannerSourceConfig>,
    offsets: Mutex<OffsetMap>,
    offsets_path: PathBuf,
    buffer: Arc<IngestionBuffer>,
    parser: RawLineParser,
}

impl FileScanner {
    pub fn new(
        sources: Vec<ScannerSourceConfig>,
        offsets_path: PathBuf,
        buffer: Arc<IngestionBuffer>,
    ) -> Self {
        let offsets = OffsetMap::load(&offsets_path);
        Self { sources, offsets: Mutex::new(offsets), offsets_path, buffer, parser: RawLineParser }
    }

    /// Forces an immediate pass over all configured directories.
    pub fn scan_all(&self) {
        for source in &self.sources {
            if let Err(err) = self.scan_source(source) {
                tracing::warn!(
                    directory = %source.directory.display(),
                    error = %err,
                    "file scan failed"
                );
            }
        }
        let offsets = self.offsets.lock().clone();
        if let Err(err) = offsets.save(&self.offsets_path) {
            tracing::warn!(error = %err, "failed to persist scanner offsets");
        }
    }

    fn scan_source(&self, source: &ScannerSourceConfig) -> std::io::Result<()> {
        let pattern = Pattern::new(&source.glob).unwrap_or_else(|_| Pattern::new("*").unwrap());
        for entry in self.list_files(&source.directory, source.recursive)? {
            let Some(file_name) = entry.file_name().and_then(|n| n.to_str()) else { continue };
            if !pattern.matches(file_name) {
                continue;
            }
            self.tail_file(&entry);
        }
        Ok(())
    }

    fn list_files(&self, dir: &Path, recursive: bool) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !dir.is_dir() {
            return Ok(files);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                if recursive {
                    files.extend(self.list_files(&path, recursive)?);
                }
            } else {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn tail_file(&self, path: &Path) {
        let key = path.to_string_lossy().to_string();
        let Ok(metadata) = fs::metadata(path) else { return };
        let inode = metadata.ino();
        let file_len = metadata.len();

        let mut offsets = self.offsets.lock();
        let (stored_inode, stored_offset) = offsets.0.get(&key).copied().unwrap_or((inode, 0));

        // Rotation: inode changed, or the file shrank (truncated in place).
        let start_offset =
            if stored_inode != inode || file_len < stored_offset { 0 } else { stored_offset };

        if start_offset >= file_len {
            offsets.0.insert(key, (inode, start_offset));
            return;
        }

        let Ok(mut file) = fs::File::open(path) else { return };
        if file.seek(SeekFrom::Start(start_offset)).is_err() {
            return;
        }

        let mut buf = String::new();
        if file.read_to_string(&mut buf).is_err() {
            return;
        }

        let mut consumed = start_offset;
        for line in buf.split_inclusive('\n') {
            consumed += line.len() as u64;
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }
            let builder = self.parser.parse(trimmed, &key);
            let record = parser::finalize(builder, DEFAULT_CLOCK_SKEW_BUDGET_MS);
            self.buffer.add(record);
        }

        offsets.0.insert(key, (inode, consumed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tails_new_bytes_and_persists_offset() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("app.log");
        {
            let mut f = fs::File::create(&file_path).unwrap();
            writeln!(f, "2021-07-01T00:00:00Z INFO first line").unwrap();
        }

        let offsets_path = dir.path().join("offsets.json");
        let buffer = Arc::new(IngestionBuffer::with_defaults());
        let scanner = FileScanner::new(
            vec![ScannerSourceConfig {
                directory: dir.path().to_path_buf(),
                glob: "*.log".to_string(),
                recursive: false,
            }],
            offsets_path.clone(),
            Arc::clone(&buffer),
        );

        scanner.scan_all();
        assert_eq!(buffer.len(), 1);

        {
            let mut f = fs::OpenOptions::new().append(true).open(&file_path).unwrap();
            writeln!(f, "2021-07-01T00:01:00Z INFO second line").unwrap();
        }
        scanner.scan_all();
        assert_eq!(buffer.len(), 2);

        // Re-scanning without new bytes appends nothing further.
        scanner.scan_all();
        assert_eq!(buffer.len(), 2);
        assert!(offsets_path.exists());
    }

    #[test]
    fn rotation_resets_offset() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("app.log");
        fs::write(&file_path, "INFO before rotation\n").unwrap();

        let buffer = Arc::new(IngestionBuffer::with_defaults());
        let scanner = FileScanner::new(
            vec![ScannerSourceConfig {
                directory: dir.path().to_path_buf(),
                glob: "*.log".to_string(),
                recursive: false,
            }],
            dir.path().join("offsets.json"),
            Arc::clone(&buffer),
        );
        scanner.scan_all();
        assert_eq!(buffer.len(), 1);

        fs::remove_file(&file_path).unwrap();
        fs::write(&file_path, "INFO after rotation\n").unwrap();
        scanner.scan_all();
        assert_eq!(buffer.len(), 2);
    }
}
