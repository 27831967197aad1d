//! Command line arguments and how they layer over the configuration file

use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::options::Options;

/// Without `--destination` the process receives into `--directory`.
#[derive(Clone, Debug, Parser)]
#[command(
    author,
    version,
    about = "warpsend - parallel multi-connection file transfer"
)]
pub struct Args {
    /// Host to send to. Omit to run as the receiver
    #[arg(short, long)]
    pub destination: Option<String>,

    /// Directory to send from, or to receive into
    #[arg(long, default_value = ".")]
    pub directory: PathBuf,

    /// TOML configuration file; flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Read `path[<TAB>size]` lines from stdin instead of walking the directory
    #[arg(long)]
    pub files: bool,

    /// Bind address for the receiver
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Keep receiving transfers until interrupted
    #[arg(long)]
    pub run_as_daemon: bool,

    #[arg(long)]
    pub num_ports: Option<u16>,

    #[arg(long)]
    pub start_port: Option<u16>,

    #[arg(long)]
    pub max_retries: Option<u32>,

    #[arg(long)]
    pub sleep_millis: Option<u64>,

    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Average rate limit across all connections (0 = unlimited)
    #[arg(long)]
    pub avg_mbytes_per_sec: Option<f64>,

    /// Peak rate limit (0 = 1.2x average, negative = none)
    #[arg(long, allow_negative_numbers = true)]
    pub max_mbytes_per_sec: Option<f64>,

    #[arg(long)]
    pub throttler_bucket_limit_bytes: Option<f64>,

    #[arg(long)]
    pub throttle_after_bytes: Option<u64>,

    #[arg(long)]
    pub connect_timeout_millis: Option<u64>,

    #[arg(long)]
    pub write_timeout_millis: Option<u64>,

    #[arg(long)]
    pub read_timeout_millis: Option<u64>,

    /// Receiver gives up on a port after this long without a sender
    /// (0 = never)
    #[arg(long)]
    pub idle_timeout_millis: Option<u64>,

    /// Split files into blocks of this size (0 = whole files)
    #[arg(long)]
    pub block_size_mbytes: Option<f64>,

    #[arg(long)]
    pub follow_symlinks: bool,

    /// Only send files matching these globs
    #[arg(long = "include", action = ArgAction::Append)]
    pub include: Vec<String>,

    /// Skip files matching these globs
    #[arg(long = "exclude", action = ArgAction::Append)]
    pub exclude: Vec<String>,

    /// Do not descend into directories matching these globs
    #[arg(long = "prune-dir", action = ArgAction::Append)]
    pub prune_dir: Vec<String>,

    /// Show a live progress line
    #[arg(short, long)]
    pub progress: bool,

    /// More diagnostics (-v info, -vv debug, -vvv trace); RUST_LOG wins
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Append a JSON report line per transfer to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Write a per-file audit trail to this file
    #[arg(long = "audit-log")]
    pub audit_log: Option<PathBuf>,
}

impl Args {
    /// Overlay every flag that was given on top of `options`.
    pub fn apply_to(&self, options: &mut Options) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field {
                    options.$field = v;
                })*
            };
        }
        set!(
            num_ports,
            start_port,
            max_retries,
            sleep_millis,
            buffer_size,
            avg_mbytes_per_sec,
            max_mbytes_per_sec,
            throttler_bucket_limit_bytes,
            throttle_after_bytes,
            connect_timeout_millis,
            write_timeout_millis,
            read_timeout_millis,
            idle_timeout_millis,
            block_size_mbytes,
        );
        if self.follow_symlinks {
            options.follow_symlinks = true;
        }
        options.include_patterns.extend(self.include.iter().cloned());
        options.exclude_patterns.extend(self.exclude.iter().cloned());
        options.prune_dir_patterns.extend(self.prune_dir.iter().cloned());
    }

    /// Default log level when RUST_LOG is not set.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiver_mode_by_default() {
        let args = Args::try_parse_from(["warpsend", "--directory", "/in"]).unwrap();
        assert!(args.destination.is_none());
        assert_eq!(args.directory, PathBuf::from("/in"));
        assert_eq!(args.log_level(), "warn");
    }

    #[test]
    fn flags_override_config() {
        let args = Args::try_parse_from([
            "warpsend",
            "-d",
            "host",
            "--num-ports",
            "3",
            "--max-mbytes-per-sec",
            "-1",
            "--exclude",
            "*.tmp",
            "--exclude",
            "*.bak",
            "--follow-symlinks",
            "--idle-timeout-millis",
            "60000",
            "-vv",
        ])
        .unwrap();
        let mut options = Options {
            num_ports: 6,
            start_port: 4000,
            exclude_patterns: vec!["core".to_string()],
            ..Options::default()
        };
        args.apply_to(&mut options);
        assert_eq!(options.num_ports, 3);
        assert_eq!(options.start_port, 4000);
        assert_eq!(options.max_mbytes_per_sec, -1.0);
        assert!(options.follow_symlinks);
        assert_eq!(options.idle_timeout_millis, 60_000);
        assert_eq!(options.exclude_patterns, vec!["core", "*.tmp", "*.bak"]);
        assert_eq!(args.log_level(), "debug");
    }
}
