use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::stats::TransferReport;

/// One finished transfer, as appended to the JSONL report log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub transfer_id: String,
    pub destination: String,
    pub source: PathBuf,
    pub status: String,
    pub exit_code: i32,
    pub num_files: u64,
    pub total_bytes: u64,
    pub effective_bytes: u64,
    pub header_bytes: u64,
    pub data_bytes: u64,
    pub failed_attempts: u64,
    pub failed_sources: Vec<String>,
    pub elapsed_secs: f64,
    pub throughput_mbytes_per_sec: f64,
}

impl TransferLogEntry {
    pub fn from_report(destination: &str, source: &Path, report: &TransferReport) -> Self {
        let s = report.summary();
        let code = report.error_code();
        Self {
            timestamp: Utc::now().to_rfc3339(),
            transfer_id: Uuid::new_v4().to_string(),
            destination: destination.to_string(),
            source: source.to_path_buf(),
            status: code.to_string(),
            exit_code: code.exit_code(),
            num_files: s.num_files(),
            total_bytes: s.total_bytes(),
            effective_bytes: s.effective_total_bytes(),
            header_bytes: s.header_bytes(),
            data_bytes: s.data_bytes(),
            failed_attempts: s.failed_attempts(),
            failed_sources: report.failed_sources().iter().map(|f| f.id.clone()).collect(),
            elapsed_secs: report.elapsed().as_secs_f64(),
            throughput_mbytes_per_sec: report.throughput_mbytes_per_sec(),
        }
    }
}

pub struct TransferLog {
    log_file_path: PathBuf,
}

impl TransferLog {
    pub fn new(path: &Path) -> Self {
        TransferLog {
            log_file_path: path.to_path_buf(),
        }
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open transfer log file")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open transfer log file for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::stats::{SourceFailure, TransferStats};
    use std::time::Duration;

    #[test]
    fn entries_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = TransferLog::new(&dir.path().join("transfers.jsonl"));
        assert!(log.read_log().unwrap().is_empty());

        let mut w = TransferStats::new();
        w.add_header_bytes(20);
        w.add_data_bytes(100);
        w.mark_effective();
        w.incr_num_files();
        let report = TransferReport::new(
            vec![w],
            vec![SourceFailure {
                id: "bad".to_string(),
                error: ErrorCode::ByteSourceReadError,
            }],
            Duration::from_secs(2),
        );
        let entry = TransferLogEntry::from_report("host", Path::new("/src"), &report);
        log.add_entry(&entry).unwrap();
        log.add_entry(&entry).unwrap();

        let back = log.read_log().unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].transfer_id, entry.transfer_id);
        assert_eq!(back[0].exit_code, ErrorCode::ByteSourceReadError.exit_code());
        assert_eq!(back[0].status, "BYTE_SOURCE_READ_ERROR");
        assert_eq!(back[0].total_bytes, 120);
        assert_eq!(back[0].failed_sources, vec!["bad".to_string()]);
    }
}
