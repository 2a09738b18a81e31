// src/report.rs
//
// =============================================================================
// RAGKEEPER: RUN REPORT LOG
// =============================================================================
//
// Appends an immutable `RunReport` per pipeline run to a magic+CRC32 framed
// binary log: a bincode-framed container wrapping a JSON payload, letting
// the payload schema evolve without breaking the framing.

use anyhow::{anyhow, Context, Result};
use crc32fast::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// "RKPR" in ASCII / Little Endian
const MAGIC_BYTES: u32 = 0x52_4B_50_52;
const MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
    Partial,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub loaded: usize,
    pub new: usize,
    pub modified: usize,
    pub deleted: usize,
    pub chunked: usize,
    pub upserted: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub job_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub error_list: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct DiskRecord {
    payload_json: Vec<u8>,
}

pub struct RunReportLog {
    path: PathBuf,
}

impl RunReportLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, report: &RunReport) -> Result<u64> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open report log: {:?}", self.path))?;
        let mut writer = BufWriter::new(file);

        let payload_bytes = serde_json::to_vec(report).context("serializing run report")?;
        let disk_rec = DiskRecord {
            payload_json: payload_bytes,
        };
        let bytes = bincode::serialize(&disk_rec).context("framing run report")?;

        let len = bytes.len() as u32;
        if len > MAX_RECORD_SIZE {
            return Err(anyhow!("run report exceeds {} byte limit", MAX_RECORD_SIZE));
        }

        let mut hasher = Hasher::new();
        hasher.update(&bytes);
        let crc = hasher.finalize();

        let offset = writer.stream_position().unwrap_or(0);
        writer.write_all(&MAGIC_BYTES.to_le_bytes())?;
        writer.write_all(&crc.to_le_bytes())?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        writer.get_ref().sync_data().ok();

        Ok(offset)
    }

    /// Reads every well-formed report in the log, self-healing past
    /// corruption by scanning forward for the next magic marker.
    pub fn read_all(&self) -> Result<Vec<RunReport>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut reports = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            reader.seek(SeekFrom::Start(cursor))?;
            let mut magic_buf = [0u8; 4];
            match reader.read_exact(&mut magic_buf) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if u32::from_le_bytes(magic_buf) != MAGIC_BYTES {
                match scan_for_magic(&mut reader, cursor + 1)? {
                    Some(next) => {
                        cursor = next;
                        continue;
                    }
                    None => break,
                }
            }

            let mut meta_buf = [0u8; 8];
            if reader.read_exact(&mut meta_buf).is_err() {
                break;
            }
            let expected_crc = u32::from_le_bytes(meta_buf[0..4].try_into()?);
            let len = u32::from_le_bytes(meta_buf[4..8].try_into()?);
            if len > MAX_RECORD_SIZE {
                break;
            }

            let mut payload = vec![0u8; len as usize];
            if reader.read_exact(&mut payload).is_err() {
                break;
            }

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != expected_crc {
                cursor += 12 + len as u64;
                continue;
            }

            let next_cursor = cursor + 12 + len as u64;
            match bincode::deserialize::<DiskRecord>(&payload)
                .ok()
                .and_then(|rec| serde_json::from_slice::<RunReport>(&rec.payload_json).ok())
            {
                Some(report) => reports.push(report),
                None => {}
            }
            cursor = next_cursor;
        }

        Ok(reports)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn scan_for_magic(reader: &mut BufReader<File>, start: u64) -> Result<Option<u64>> {
    reader.seek(SeekFrom::Start(start))?;
    let mut window = [0u8; 4];
    let mut filled = 0;
    let mut pos = start;
    let mut byte = [0u8; 1];

    while filled < 4 {
        if reader.read(&mut byte)? == 0 {
            return Ok(None);
        }
        window[filled] = byte[0];
        filled += 1;
        pos += 1;
    }

    loop {
        if u32::from_le_bytes(window) == MAGIC_BYTES {
            return Ok(Some(pos - 4));
        }
        if reader.read(&mut byte)? == 0 {
            return Ok(None);
        }
        window.copy_within(1..4, 0);
        window[3] = byte[0];
        pos += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_report() -> RunReport {
        RunReport {
            job_id: "daily".into(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            status: RunStatus::Success,
            counts: RunCounts::default(),
            error_list: Vec::new(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn append_then_read_all_round_trips() {
        let dir = tempdir().unwrap();
        let log = RunReportLog::new(dir.path().join("reports.log"));
        log.append(&sample_report()).unwrap();
        log.append(&sample_report()).unwrap();
        let reports = log.read_all().unwrap();
        assert_eq!(reports.len(), 2);
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let dir = tempdir().unwrap();
        let log = RunReportLog::new(dir.path().join("missing.log"));
        assert!(log.read_all().unwrap().is_empty());
    }
}
