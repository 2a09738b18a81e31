// src/ledger.rs
//
// =============================================================================
// RAGKEEPER: METADATA LEDGER
// =============================================================================
//
// The sole source of truth for "what the vector store currently contains."
// Backed by a CSV file, rewritten atomically (write-temp, fsync, rename) and
// rotated into numbered backups: rename first, fall back to copy+delete
// across devices, fsync the containing directory for durability.

use crate::config::ChecksumAlgorithm;
use crate::error::IndexError;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

pub const LEDGER_HEADER: &[&str] = &[
    "source",
    "content_checksum",
    "last_modified",
    "indexed_timestamp",
    "indexed",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub source: String,
    pub content_checksum: String,
    pub last_modified: i64,
    pub indexed_timestamp: i64,
    pub indexed: bool,
}

pub fn checksum_hex(algorithm: ChecksumAlgorithm, content: &[u8]) -> String {
    match algorithm {
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(content);
            hex::encode(hasher.finalize())
        }
        ChecksumAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            hasher.update(content);
            hex::encode(hasher.finalize())
        }
    }
}

pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns an empty mapping if the file is missing. A present-but-corrupt
    /// file is a `LedgerError`, never silently treated as empty.
    pub fn load(&self) -> Result<HashMap<String, LedgerRow>, IndexError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)
            .map_err(|e| IndexError::Ledger(format!("cannot open ledger {:?}: {e}", self.path)))?;

        let headers = reader
            .headers()
            .map_err(|e| IndexError::Ledger(format!("corrupt ledger header: {e}")))?
            .clone();
        if headers.iter().ne(LEDGER_HEADER.iter().copied()) {
            return Err(IndexError::Ledger(format!(
                "ledger {:?} has unexpected columns: {:?}",
                self.path, headers
            )));
        }

        let mut rows = HashMap::new();
        for result in reader.deserialize::<LedgerRow>() {
            let row = result.map_err(|e| IndexError::Ledger(format!("corrupt ledger row: {e}")))?;
            rows.insert(row.source.clone(), row);
        }
        Ok(rows)
    }

    /// Atomic from the reader's perspective: write to a sibling temp file,
    /// fsync, then rename over the target. Falls back to copy+delete when
    /// the temp file lives on a different device than the target.
    pub fn save(&self, rows: &HashMap<String, LedgerRow>) -> Result<(), IndexError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| IndexError::Ledger(format!("cannot create {:?}: {e}", parent)))?;
        }

        let mut ordered: Vec<&LedgerRow> = rows.values().collect();
        ordered.sort_by(|a, b| a.source.cmp(&b.source));

        let tmp_path = self.path.with_extension("csv.tmp");
        {
            let mut writer = WriterBuilder::new()
                .has_headers(true)
                .from_path(&tmp_path)
                .map_err(|e| IndexError::Ledger(format!("cannot open temp ledger: {e}")))?;
            for row in ordered {
                writer
                    .serialize(row)
                    .map_err(|e| IndexError::Ledger(format!("cannot write ledger row: {e}")))?;
            }
            writer
                .flush()
                .map_err(|e| IndexError::Ledger(format!("cannot flush ledger: {e}")))?;
        }
        if let Ok(f) = File::open(&tmp_path) {
            let _ = f.sync_all();
        }

        if fs::rename(&tmp_path, &self.path).is_err() {
            fs::copy(&tmp_path, &self.path)
                .map_err(|e| IndexError::Ledger(format!("cannot copy ledger into place: {e}")))?;
            let _ = fs::remove_file(&tmp_path);
        }
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    /// Copies the current ledger to a timestamped sibling. A missing ledger
    /// has nothing to back up and is a no-op.
    pub fn backup(&self, now: DateTime<Utc>) -> Result<Option<PathBuf>, IndexError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let stamp = now.format("%Y%m%dT%H%M%S%.6f");
        let backup_path = self
            .path
            .with_extension(format!("csv.bak.{}", stamp));
        if fs::copy(&self.path, &backup_path).is_err() {
            // copy failed outright; fall back to a rename, then put a fresh
            // copy back in place so the live file is never left missing
            fs::rename(&self.path, &backup_path)
                .map_err(|e| IndexError::Ledger(format!("cannot create backup: {e}")))?;
            fs::copy(&backup_path, &self.path)
                .map_err(|e| IndexError::Ledger(format!("cannot restore live ledger after backup rename: {e}")))?;
        }
        Ok(Some(backup_path))
    }

    fn list_backups(&self) -> Result<Vec<PathBuf>, IndexError> {
        let parent = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("ledger")
            .to_string();
        let prefix = format!("{}.csv.bak.", stem);
        let mut backups = Vec::new();
        if let Ok(entries) = fs::read_dir(parent) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if let Some(name) = name.to_str() {
                    if name.starts_with(&prefix) {
                        backups.push(entry.path());
                    }
                }
            }
        }
        backups.sort();
        Ok(backups)
    }

    /// Restores the ledger from the most recent backup by filename sort order.
    pub fn restore_latest(&self) -> Result<bool, IndexError> {
        let backups = self.list_backups()?;
        let latest = match backups.last() {
            Some(b) => b.clone(),
            None => return Ok(false),
        };
        fs::copy(&latest, &self.path)
            .map_err(|e| IndexError::Ledger(format!("cannot restore from {:?}: {e}", latest)))?;
        Ok(true)
    }

    /// Retains the newest `keep_n` backups by filename sort order, deleting the rest.
    pub fn cleanup_backups(&self, keep_n: usize) -> Result<usize, IndexError> {
        let backups = self.list_backups()?;
        if backups.len() <= keep_n {
            return Ok(0);
        }
        let to_remove = &backups[..backups.len() - keep_n];
        let mut removed = 0;
        for path in to_remove {
            if fs::remove_file(path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(source: &str, checksum: &str) -> LedgerRow {
        LedgerRow {
            source: source.to_string(),
            content_checksum: checksum.to_string(),
            last_modified: 1_700_000_000,
            indexed_timestamp: 1_700_000_100,
            indexed: true,
        }
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.csv"));
        assert!(ledger.load().unwrap().is_empty());
    }

    #[test]
    fn save_load_round_trip_preserves_rows() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.csv"));
        let mut rows = HashMap::new();
        rows.insert("a.md".to_string(), row("a.md", "deadbeef"));
        rows.insert("b.md".to_string(), row("b.md", "cafef00d"));
        ledger.save(&rows).unwrap();

        let loaded = ledger.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["a.md"], rows["a.md"]);
        assert_eq!(loaded["b.md"], rows["b.md"]);
    }

    #[test]
    fn corrupt_header_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.csv");
        fs::write(&path, "not,the,right,columns\n1,2,3,4\n").unwrap();
        let ledger = Ledger::new(path);
        assert!(matches!(ledger.load(), Err(IndexError::Ledger(_))));
    }

    #[test]
    fn backup_then_cleanup_keeps_newest_n() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.csv"));
        let mut rows = HashMap::new();
        rows.insert("a.md".to_string(), row("a.md", "aaa"));
        ledger.save(&rows).unwrap();

        for i in 0..5u32 {
            let t = Utc::now() + chrono::Duration::seconds(i as i64);
            ledger.backup(t).unwrap();
        }
        let removed = ledger.cleanup_backups(2).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(ledger.list_backups().unwrap().len(), 2);
    }

    #[test]
    fn checksum_changes_with_algorithm() {
        let data = b"hello world";
        let sha = checksum_hex(ChecksumAlgorithm::Sha256, data);
        let md5 = checksum_hex(ChecksumAlgorithm::Md5, data);
        assert_ne!(sha, md5);
    }
}
