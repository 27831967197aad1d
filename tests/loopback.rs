use anyhow::Result;
use std::io::Write;
use std::net::TcpListener;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use warpsend::error::ErrorCode;
use warpsend::fs_enum::FileEntry;
use warpsend::options::Options;
use warpsend::receiver::{ReceiveReport, Receiver};
use warpsend::sender::Sender;

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = size;
    let mut val: u8 = (size % 251) as u8;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(7);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

fn base_options(num_ports: u16) -> Options {
    Options {
        num_ports,
        max_retries: 3,
        sleep_millis: 10,
        buffer_size: 16 * 1024,
        ..Options::default()
    }
}

/// Bind a receiver on `num_ports` consecutive free ports and return it with
/// the options a sender needs to reach it.
fn bind_receiver(dst: &Path, mut options: Options) -> Result<(Receiver, Options)> {
    let mut last_err = None;
    for _ in 0..20 {
        let base = TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
        if u32::from(base) + u32::from(options.num_ports) > u32::from(u16::MAX) {
            continue;
        }
        options.start_port = base;
        match Receiver::bind("127.0.0.1", &options, dst) {
            Ok(rx) => return Ok((rx.with_idle_timeout(Duration::from_secs(20)), options)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no free port range")))
}

fn assert_same_tree(src: &Path, dst: &Path, rels: &[&str]) {
    for rel in rels {
        let a = std::fs::read(src.join(rel)).unwrap();
        let b = std::fs::read(dst.join(rel)).unwrap_or_else(|e| panic!("{rel}: {e}"));
        assert_eq!(a.len(), b.len(), "{rel}");
        assert!(a == b, "{rel} differs");
    }
}

fn run_receiver(rx: Receiver) -> thread::JoinHandle<ReceiveReport> {
    thread::spawn(move || rx.receive().unwrap())
}

#[test]
fn directory_transfer_over_loopback() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let files = [
        ("a.txt", 8 * 1024),
        ("empty", 0),
        ("dir1/b.bin", 256 * 1024),
        ("dir1/dir2/c.dat", 1_100_000),
    ];
    for (rel, size) in files {
        write_file(&src.path().join(rel), size)?;
    }

    let (rx, options) = bind_receiver(dst.path(), base_options(4))?;
    let server = run_receiver(rx);
    let report = Sender::new("127.0.0.1", options).start(src.path())?;
    let received = server.join().unwrap();

    assert_eq!(report.error_code(), ErrorCode::Ok, "{:?}", report.workers());
    let summary = report.summary();
    assert_eq!(summary.num_files(), 4);
    assert_eq!(summary.data_bytes(), 8 * 1024 + 256 * 1024 + 1_100_000);
    assert_eq!(summary.effective_total_bytes(), summary.total_bytes());
    assert_eq!(summary.handshake_failures(), 0);
    assert_eq!(report.workers().len(), 4);
    assert!(report.failed_sources().is_empty());

    assert_eq!(received.files, 4);
    assert_eq!(received.failed_connections, 0);
    assert_same_tree(src.path(), dst.path(), &files.map(|(rel, _)| rel));
    Ok(())
}

#[test]
fn large_file_sent_in_blocks() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    write_file(&src.path().join("big.img"), 1_000_000)?;
    write_file(&src.path().join("small"), 1000)?;
    // leftovers from an older, longer copy must not survive
    write_file(&dst.path().join("big.img"), 1_500_000)?;
    write_file(&dst.path().join("small"), 4000)?;

    let options = Options {
        // 64 KiB blocks
        block_size_mbytes: 0.0625,
        ..base_options(3)
    };
    let (rx, options) = bind_receiver(dst.path(), options)?;
    let server = run_receiver(rx);
    let report = Sender::new("127.0.0.1", options).start(src.path())?;
    server.join().unwrap();

    assert!(report.into_result().is_ok());
    assert_same_tree(src.path(), dst.path(), &["big.img", "small"]);
    Ok(())
}

#[test]
fn explicit_file_list_sends_only_listed_files() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    write_file(&src.path().join("keep/one"), 5000)?;
    write_file(&src.path().join("skip"), 10)?;

    let (rx, options) = bind_receiver(dst.path(), base_options(2))?;
    let server = run_receiver(rx);
    let entries = vec![FileEntry {
        path: src.path().join("keep/one"),
        id: "keep/one".to_string(),
        size: 5000,
    }];
    let report = Sender::new("127.0.0.1", options).start_with_files(src.path(), &entries);
    server.join().unwrap();

    assert_eq!(report.error_code(), ErrorCode::Ok);
    assert_eq!(report.summary().num_files(), 1);
    assert_same_tree(src.path(), dst.path(), &["keep/one"]);
    assert!(!dst.path().join("skip").exists());
    Ok(())
}

#[test]
fn rate_limit_slows_transfer_down() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    write_file(&src.path().join("f"), 1024 * 1024)?;

    let options = Options {
        avg_mbytes_per_sec: 2.0,
        ..base_options(2)
    };
    let (rx, options) = bind_receiver(dst.path(), options)?;
    let server = run_receiver(rx);
    let started = Instant::now();
    let report = Sender::new("127.0.0.1", options).start(src.path())?;
    server.join().unwrap();

    assert_eq!(report.error_code(), ErrorCode::Ok);
    // 1 MiB at 2 MiB/s takes about half a second
    assert!(started.elapsed() >= Duration::from_millis(400), "{:?}", started.elapsed());
    Ok(())
}

#[test]
fn unreachable_receiver_reports_connection_error() -> Result<()> {
    let src = tempfile::tempdir()?;
    write_file(&src.path().join("f"), 100)?;
    let port = TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();

    let options = Options {
        start_port: port,
        ..base_options(1)
    };
    let report = Sender::new("127.0.0.1", options).start(src.path())?;
    assert_eq!(report.error_code(), ErrorCode::ConnError);
    assert_eq!(report.summary().total_bytes(), 0);
    assert_eq!(report.error_code().exit_code(), 2);
    Ok(())
}

#[test]
fn missing_source_directory_is_an_error() {
    let sender = Sender::new("127.0.0.1", base_options(1));
    assert!(sender.start(Path::new("/definitely/not/here")).is_err());
}
