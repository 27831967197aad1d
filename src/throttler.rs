//! Bandwidth limiter shared by every sender connection
//!
//! Two limits, both optional:
//! - average rate: the total progress since start may not run ahead of
//!   `elapsed * avg_rate`
//! - peak rate: a token bucket refilled at `peak_rate`, holding at most
//!   `bucket_limit` bytes, bounds bursts
//!
//! The caller sleeps for whichever limit demands the longer pause.

use parking_lot::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

/// Anything that can slow a connection down after it sent some bytes.
pub trait Throttle: Send + Sync {
    fn limit(&self, bytes: f64);
}

struct ThrottleState {
    start: Instant,
    last_call: Instant,
    progress: f64,
    tokens: f64,
}

pub struct Throttler {
    avg_rate: f64,
    peak_rate: f64,
    bucket_limit: f64,
    state: Mutex<ThrottleState>,
}

impl Throttler {
    /// Rates in bytes per second; zero (or negative) disables that limit.
    pub fn new(start: Instant, avg_rate: f64, peak_rate: f64, bucket_limit: f64) -> Self {
        let peak_rate = peak_rate.max(0.0);
        let bucket_limit = if bucket_limit > 0.0 {
            bucket_limit
        } else {
            peak_rate / 4.0
        };
        Self {
            avg_rate: avg_rate.max(0.0),
            peak_rate,
            bucket_limit,
            state: Mutex::new(ThrottleState {
                start,
                last_call: start,
                progress: 0.0,
                tokens: bucket_limit,
            }),
        }
    }

    /// True if at least one limit is configured.
    pub fn is_limiting(&self) -> bool {
        self.avg_rate > 0.0 || self.peak_rate > 0.0
    }

    /// Account for `bytes` sent at `now` and return how long the caller has
    /// to pause.
    fn record(&self, bytes: f64, now: Instant) -> Duration {
        if !bytes.is_finite() || bytes <= 0.0 || !self.is_limiting() {
            return Duration::ZERO;
        }
        let mut st = self.state.lock();
        st.progress += bytes;
        let mut sleep_secs: f64 = 0.0;

        if self.avg_rate > 0.0 {
            let elapsed = now.saturating_duration_since(st.start).as_secs_f64();
            let ideal = st.progress / self.avg_rate;
            sleep_secs = sleep_secs.max(ideal - elapsed);
        }

        if self.peak_rate > 0.0 {
            let since_last = now.saturating_duration_since(st.last_call).as_secs_f64();
            st.last_call = st.last_call.max(now);
            st.tokens = (st.tokens + since_last * self.peak_rate).min(self.bucket_limit);
            st.tokens -= bytes;
            if st.tokens < 0.0 {
                sleep_secs = sleep_secs.max(-st.tokens / self.peak_rate);
            }
        }

        if sleep_secs > 0.0 && sleep_secs.is_finite() {
            Duration::from_secs_f64(sleep_secs)
        } else {
            Duration::ZERO
        }
    }
}

impl Throttle for Throttler {
    fn limit(&self, bytes: f64) {
        let pause = self.record(bytes, Instant::now());
        if !pause.is_zero() {
            trace!(bytes, pause_ms = pause.as_millis() as u64, "throttling");
            thread::sleep(pause);
        }
    }
}
