//! warpsend - send a directory tree over many parallel TCP connections
//!
//! With `--destination` the process sends `--directory`; without it, it
//! receives into `--directory`.

use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warpsend::cli::Args;
use warpsend::fs_enum::read_file_list;
use warpsend::log::{TransferLog, TransferLogEntry};
use warpsend::logger::{Logger, NoopLogger, TextLogger};
use warpsend::options::Options;
use warpsend::progress::{ProgressDisplay, TransferProgress};
use warpsend::receiver::Receiver;
use warpsend::sender::Sender;
use warpsend::stats::TransferReport;

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // 128 + SIGINT
        std::process::exit(130);
    })
    .context("setting Ctrl-C handler")?;

    let args = Args::parse();
    init_tracing(&args);

    let options = load_options(&args)?;
    match args.destination.as_deref() {
        Some(dest) => {
            let code = send_main(&args, &options, dest)?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        None => receive_main(&args, &options),
    }
}

fn init_tracing(args: &Args) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("warpsend={}", args.log_level()))),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Defaults, then the config file, then command line flags.
fn load_options(args: &Args) -> Result<Options> {
    let mut options = match &args.config {
        Some(path) => Options::load(path)?,
        None => Options::default(),
    };
    args.apply_to(&mut options);
    options.validate()?;
    Ok(options)
}

fn send_main(args: &Args, options: &Options, dest: &str) -> Result<i32> {
    let logger: Arc<dyn Logger> = match &args.audit_log {
        Some(path) => match TextLogger::new(path) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "audit log disabled");
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    };
    let progress = Arc::new(TransferProgress::new());
    let sender = Sender::new(dest, options.clone())
        .with_logger(logger)
        .with_progress(Arc::clone(&progress));

    let display = args.progress.then(|| ProgressDisplay::start(Arc::clone(&progress)));
    let report = if args.files {
        let entries = read_file_list(io::stdin().lock(), &args.directory)
            .context("reading file list from stdin")?;
        info!(files = entries.len(), "file list read");
        sender.start_with_files(&args.directory, &entries)
    } else {
        sender.start(&args.directory)?
    };
    if let Some(display) = display {
        display.finish(&summary_line(&report));
    }

    print_report(&report);
    if let Some(path) = &args.log_file {
        let entry = TransferLogEntry::from_report(dest, &args.directory, &report);
        if let Err(e) = TransferLog::new(path).add_entry(&entry) {
            warn!(error = %format!("{e:#}"), path = %path.display(), "cannot write transfer log");
        }
    }

    let code = report.error_code().exit_code();
    if let Err(e) = report.into_result() {
        eprintln!("warpsend: {e}");
    }
    Ok(code)
}

fn receive_main(args: &Args, options: &Options) -> Result<()> {
    let receiver = Receiver::bind(&args.bind, options, &args.directory)?;
    eprintln!(
        "warpsend receiving into {} on ports {:?}",
        receiver.root().display(),
        receiver.ports()
    );
    if args.run_as_daemon {
        return receiver.run_daemon();
    }
    let report = receiver.receive()?;
    println!(
        "Received {} files ({:.2} MB) over {} connections",
        report.files,
        report.bytes as f64 / 1_048_576.0,
        report.connections
    );
    Ok(())
}

fn summary_line(report: &TransferReport) -> String {
    let s = report.summary();
    format!(
        "Sent {} files ({:.2} MB) in {:.2}s, {:.2} MB/s",
        s.num_files(),
        s.effective_total_bytes() as f64 / 1_048_576.0,
        report.elapsed().as_secs_f64(),
        report.throughput_mbytes_per_sec()
    )
}

fn print_report(report: &TransferReport) {
    let s = report.summary();
    println!("{}", summary_line(report));
    println!(
        "  total {} bytes, effective {} bytes, {} failed attempts",
        s.total_bytes(),
        s.effective_total_bytes(),
        s.failed_attempts()
    );
    if s.handshake_failures() > 0 {
        println!("  {} connections ended without acknowledgement", s.handshake_failures());
    }
    for failure in report.failed_sources() {
        println!("  FAILED {} ({})", failure.id, failure.error);
    }
    println!("  status {}", report.error_code());
}
