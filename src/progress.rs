//! Live transfer counters and a spinner that renders them

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(250);

/// Counters bumped by every sender connection.
#[derive(Debug, Default)]
pub struct TransferProgress {
    bytes: AtomicU64,
    files: AtomicU64,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_file(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn files(&self) -> u64 {
        self.files.load(Ordering::Relaxed)
    }
}

fn status_line(files: u64, bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.1 {
        format!(" @ {:.1} MB/s", bytes as f64 / secs / 1_048_576.0)
    } else {
        String::new()
    };
    format!(
        "Sending {} files ({:.1} MB) in {:.1}s{}",
        files,
        bytes as f64 / 1_048_576.0,
        secs,
        rate
    )
}

/// Spinner on stderr, refreshed from `TransferProgress` by a ticker thread
pub struct ProgressDisplay {
    spinner: ProgressBar,
    stop: Arc<AtomicBool>,
    ticker: Option<thread::JoinHandle<()>>,
}

impl ProgressDisplay {
    pub fn start(progress: Arc<TransferProgress>) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        let stop = Arc::new(AtomicBool::new(false));
        let ticker = {
            let spinner = spinner.clone();
            let stop = Arc::clone(&stop);
            let start = Instant::now();
            thread::Builder::new()
                .name("progress".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        spinner.set_message(status_line(
                            progress.files(),
                            progress.bytes(),
                            start.elapsed(),
                        ));
                        thread::sleep(TICK);
                    }
                })
                .ok()
        };
        Self {
            spinner,
            stop,
            ticker,
        }
    }

    pub fn finish(mut self, message: &str) {
        self.shutdown();
        self.spinner.finish_with_message(message.to_string());
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.ticker.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ProgressDisplay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_threads() {
        let p = Arc::new(TransferProgress::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let p = Arc::clone(&p);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        p.add_bytes(3);
                    }
                    p.add_file();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(p.bytes(), 12_000);
        assert_eq!(p.files(), 4);
    }

    #[test]
    fn status_line_shows_rate_after_warmup() {
        assert_eq!(
            status_line(2, 0, Duration::from_millis(40)),
            "Sending 2 files (0.0 MB) in 0.0s"
        );
        let line = status_line(3, 4 * 1_048_576, Duration::from_secs(2));
        assert!(line.ends_with("@ 2.0 MB/s"), "{line}");
    }
}
