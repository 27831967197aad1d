//! Byte accounting for a single source, a connection, and a whole transfer

use crate::error::{ErrorCode, ReportError};
use serde::Serialize;
use std::time::Duration;

/// Byte counts and terminal error for one unit of work.
///
/// "Effective" bytes are the subset of header/data bytes that belonged to a
/// source that was transmitted completely. Bytes spent on an attempt that
/// later failed stay in the totals but never become effective, so
/// `total - effective` is the wire traffic wasted on retries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    #[serde(skip_serializing_if = "String::is_empty")]
    id: String,
    header_bytes: u64,
    data_bytes: u64,
    effective_header_bytes: u64,
    effective_data_bytes: u64,
    num_files: u64,
    failed_attempts: u64,
    handshake_failures: u64,
    error_code: ErrorCode,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats scoped to one byte source.
    pub fn for_source(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_header_bytes(&mut self, n: u64) {
        self.header_bytes += n;
    }

    pub fn add_data_bytes(&mut self, n: u64) {
        self.data_bytes += n;
    }

    /// Count bytes that are effective from the start (protocol commands that
    /// cannot be wasted, such as the end-of-transfer marker).
    pub fn add_effective_bytes(&mut self, header: u64, data: u64) {
        self.effective_header_bytes += header;
        self.effective_data_bytes += data;
        debug_assert!(self.effective_header_bytes <= self.header_bytes);
        debug_assert!(self.effective_data_bytes <= self.data_bytes);
    }

    /// Promote everything counted so far to effective. Called once a source
    /// has been sent in full.
    pub fn mark_effective(&mut self) {
        self.effective_header_bytes = self.header_bytes;
        self.effective_data_bytes = self.data_bytes;
    }

    pub fn incr_num_files(&mut self) {
        self.num_files += 1;
    }

    pub fn incr_failed_attempts(&mut self) {
        self.failed_attempts += 1;
    }

    pub fn incr_handshake_failures(&mut self) {
        self.handshake_failures += 1;
    }

    pub fn set_error_code(&mut self, code: ErrorCode) {
        self.error_code = code;
    }

    pub fn error_code(&self) -> ErrorCode {
        self.error_code
    }

    pub fn header_bytes(&self) -> u64 {
        self.header_bytes
    }

    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.header_bytes + self.data_bytes
    }

    pub fn effective_header_bytes(&self) -> u64 {
        self.effective_header_bytes
    }

    pub fn effective_data_bytes(&self) -> u64 {
        self.effective_data_bytes
    }

    pub fn effective_total_bytes(&self) -> u64 {
        self.effective_header_bytes + self.effective_data_bytes
    }

    pub fn num_files(&self) -> u64 {
        self.num_files
    }

    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts
    }

    pub fn handshake_failures(&self) -> u64 {
        self.handshake_failures
    }

    /// Sum the counters of `other` into `self` without touching the error
    /// code. Used by a connection folding in per-source results, whose
    /// errors are resolved locally (requeue or skip).
    pub fn add_counts(&mut self, other: &TransferStats) {
        self.header_bytes += other.header_bytes;
        self.data_bytes += other.data_bytes;
        self.effective_header_bytes += other.effective_header_bytes;
        self.effective_data_bytes += other.effective_data_bytes;
        self.num_files += other.num_files;
        self.failed_attempts += other.failed_attempts;
        self.handshake_failures += other.handshake_failures;
    }

    /// Sum counters and merge error codes (first non-OK wins).
    pub fn merge(&mut self, other: &TransferStats) {
        self.add_counts(other);
        self.error_code = self.error_code.merge(other.error_code);
    }
}

/// A source that was abandoned for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub id: String,
    pub error: ErrorCode,
}

/// Final result of a transfer handed back to the caller.
#[derive(Debug, Clone)]
pub struct TransferReport {
    summary: TransferStats,
    workers: Vec<TransferStats>,
    failed_sources: Vec<SourceFailure>,
    elapsed: Duration,
}

impl TransferReport {
    /// Build the report from per-connection aggregates in slot order.
    pub fn new(
        workers: Vec<TransferStats>,
        failed_sources: Vec<SourceFailure>,
        elapsed: Duration,
    ) -> Self {
        let mut summary = TransferStats::new();
        for w in &workers {
            summary.merge(w);
        }
        Self {
            summary,
            workers,
            failed_sources,
            elapsed,
        }
    }

    pub fn summary(&self) -> &TransferStats {
        &self.summary
    }

    pub fn workers(&self) -> &[TransferStats] {
        &self.workers
    }

    pub fn failed_sources(&self) -> &[SourceFailure] {
        &self.failed_sources
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Transfer-level outcome: the first connection error in slot order,
    /// otherwise the error of the first abandoned source, otherwise OK.
    pub fn error_code(&self) -> ErrorCode {
        let code = self.summary.error_code();
        match self.failed_sources.first() {
            Some(failure) => code.merge(failure.error),
            None => code,
        }
    }

    /// Effective throughput in MiB/s.
    pub fn throughput_mbytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.summary.effective_total_bytes() as f64 / secs / 1_048_576.0
    }

    pub fn into_result(self) -> Result<Self, ReportError> {
        let code = self.error_code();
        if code.is_ok() {
            Ok(self)
        } else {
            Err(ReportError::Failed {
                code,
                files_failed: self.failed_sources.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_stats(header: u64, data: u64, code: ErrorCode) -> TransferStats {
        let mut s = TransferStats::for_source("f");
        s.add_header_bytes(header);
        s.add_data_bytes(data);
        s.set_error_code(code);
        if code.is_ok() {
            s.mark_effective();
            s.incr_num_files();
        } else {
            s.incr_failed_attempts();
        }
        s
    }

    #[test]
    fn effective_bytes_only_for_completed_sources() {
        let mut conn = TransferStats::new();
        conn.add_counts(&source_stats(2, 3, ErrorCode::ByteSourceReadError));
        conn.add_counts(&source_stats(4, 10, ErrorCode::Ok));

        assert_eq!(conn.error_code(), ErrorCode::Ok);
        assert_eq!(conn.total_bytes(), 19);
        assert_eq!(conn.effective_total_bytes(), 14);
        assert_eq!(conn.effective_header_bytes(), 4);
        assert_eq!(conn.effective_data_bytes(), 10);
        assert_eq!(conn.num_files(), 1);
        assert_eq!(conn.failed_attempts(), 1);
    }

    #[test]
    fn report_merges_workers_in_order() {
        let mut a = TransferStats::new();
        a.add_counts(&source_stats(3, 3, ErrorCode::Ok));
        let mut b = TransferStats::new();
        b.set_error_code(ErrorCode::ConnError);
        let mut c = TransferStats::new();
        c.set_error_code(ErrorCode::SocketWriteError);

        let report = TransferReport::new(vec![a, b, c], Vec::new(), Duration::from_secs(1));
        assert_eq!(report.error_code(), ErrorCode::ConnError);
        assert_eq!(report.summary().total_bytes(), 6);
        assert_eq!(report.summary().effective_total_bytes(), 6);
        assert!(report.into_result().is_err());
    }

    #[test]
    fn report_surfaces_abandoned_sources() {
        let report = TransferReport::new(
            vec![TransferStats::new()],
            vec![SourceFailure {
                id: "broken.bin".to_string(),
                error: ErrorCode::ByteSourceReadError,
            }],
            Duration::from_millis(10),
        );
        assert_eq!(report.summary().error_code(), ErrorCode::Ok);
        assert_eq!(report.error_code(), ErrorCode::ByteSourceReadError);
        let err = report.into_result().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ByteSourceReadError);
    }
}
