//! Monotonic clock.
//!
//! Millisecond uptime measured from the first query. All timeouts in
//! the stack are relative, so the epoch does not matter — only
//! monotonicity does.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the process first asked for the time.
#[inline]
pub fn uptime_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Suspend the calling task for `ms` milliseconds.
#[inline]
pub fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}
