use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::ErrorCode;

/// Per-source audit trail. Called from every sender connection.
pub trait Logger: Send + Sync {
    fn start(&self, _dest: &str, _ports: &[u16]) {}
    fn source_sent(&self, _id: &str, _offset: u64, _bytes: u64) {}
    fn source_failed(&self, _id: &str, _code: ErrorCode, _requeued: bool) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening audit log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn start(&self, dest: &str, ports: &[u16]) {
        let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
        self.line(&format!("START dest={} ports={}", dest, ports.join(",")));
    }
    fn source_sent(&self, id: &str, offset: u64, bytes: u64) {
        self.line(&format!("SENT id={id} offset={offset} bytes={bytes}"));
    }
    fn source_failed(&self, id: &str, code: ErrorCode, requeued: bool) {
        self.line(&format!("FAIL id={id} error={code} requeued={requeued}"));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}
