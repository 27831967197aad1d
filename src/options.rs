//! Transfer configuration: defaults, optional TOML file, CLI overrides

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::fs_enum::FileFilter;
use crate::socket::SocketConfig;

const MB: f64 = 1_048_576.0;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Parallel connections, one per port starting at `start_port`
    pub num_ports: u16,
    pub start_port: u16,
    /// Connect attempts per connection, and reconnects after a broken
    /// connection
    pub max_retries: u32,
    /// Pause between connect attempts
    pub sleep_millis: u64,
    /// Largest chunk read from a source and written in one go
    pub buffer_size: usize,
    /// 0 = unlimited
    pub avg_mbytes_per_sec: f64,
    /// 0 = 1.2x the average rate, negative = no peak limit
    pub max_mbytes_per_sec: f64,
    /// 0 = a quarter second worth of peak rate
    pub throttler_bucket_limit_bytes: f64,
    /// Bytes a connection sends before throttling applies to it
    pub throttle_after_bytes: u64,
    pub connect_timeout_millis: u64,
    pub write_timeout_millis: u64,
    /// Bounds the wait for the receiver to close after DONE
    pub read_timeout_millis: u64,
    /// Receiver: stop waiting on a port after this long without a
    /// connection (0 = wait forever)
    pub idle_timeout_millis: u64,
    /// 0 = send files whole
    pub block_size_mbytes: f64,
    pub send_buffer_bytes: usize,
    pub follow_symlinks: bool,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub prune_dir_patterns: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_ports: 8,
            start_port: 22356,
            max_retries: 5,
            sleep_millis: 50,
            buffer_size: 256 * 1024,
            avg_mbytes_per_sec: 0.0,
            max_mbytes_per_sec: 0.0,
            throttler_bucket_limit_bytes: 0.0,
            throttle_after_bytes: 0,
            connect_timeout_millis: 2000,
            write_timeout_millis: 30_000,
            read_timeout_millis: 5000,
            idle_timeout_millis: 0,
            block_size_mbytes: 0.0,
            send_buffer_bytes: 0,
            follow_symlinks: false,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            prune_dir_patterns: Vec::new(),
        }
    }
}

impl Options {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let opts: Options = toml::from_str(s).context("invalid configuration")?;
        Ok(opts)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_ports == 0 {
            bail!("num_ports must be at least 1");
        }
        if self.buffer_size == 0 {
            bail!("buffer_size must be positive");
        }
        if self.max_retries == 0 {
            bail!("max_retries must be at least 1");
        }
        if u32::from(self.start_port) + u32::from(self.num_ports) - 1 > u32::from(u16::MAX) {
            bail!(
                "port range {}+{} exceeds 65535",
                self.start_port,
                self.num_ports
            );
        }
        if self.avg_mbytes_per_sec < 0.0 {
            bail!("avg_mbytes_per_sec cannot be negative");
        }
        if self.connect_timeout_millis == 0
            || self.read_timeout_millis == 0
            || self.write_timeout_millis == 0
        {
            bail!("socket timeouts must be positive");
        }
        if self.block_size_mbytes < 0.0 {
            bail!("block_size_mbytes cannot be negative");
        }
        Ok(())
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        let start = self.start_port;
        (0..self.num_ports).map(move |i| start.wrapping_add(i))
    }

    /// (average, peak, bucket) in bytes per second / bytes.
    pub fn throttler_rates(&self) -> (f64, f64, f64) {
        let avg = self.avg_mbytes_per_sec.max(0.0) * MB;
        let peak = if self.max_mbytes_per_sec > 0.0 {
            self.max_mbytes_per_sec * MB
        } else if self.max_mbytes_per_sec == 0.0 {
            avg * 1.2
        } else {
            0.0
        };
        (avg, peak, self.throttler_bucket_limit_bytes.max(0.0))
    }

    pub fn block_size_bytes(&self) -> u64 {
        (self.block_size_mbytes.max(0.0) * MB) as u64
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.sleep_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_millis > 0).then(|| Duration::from_millis(self.idle_timeout_millis))
    }

    pub fn socket_config(&self) -> SocketConfig {
        SocketConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_millis),
            read_timeout: Duration::from_millis(self.read_timeout_millis),
            write_timeout: Duration::from_millis(self.write_timeout_millis),
            send_buffer_size: (self.send_buffer_bytes > 0).then_some(self.send_buffer_bytes),
        }
    }

    pub fn file_filter(&self) -> FileFilter {
        FileFilter {
            include: self.include_patterns.clone(),
            exclude: self.exclude_patterns.clone(),
            prune_dirs: self.prune_dir_patterns.clone(),
        }
    }
}
