//! Cooperative-kernel signal primitive.
//!
//! A [`Signal`] is a single-bit event: producers [`raise`](Signal::raise)
//! it (from a parser, a driver callback, or another task), consumers
//! block on it with a deadline. Raising an already-raised signal is a
//! no-op — signals do not count, they coalesce. Consumers that need
//! level-triggered behaviour poll their own state before waiting.
//!
//! Every blocking wait is gated by a timeout computed immediately
//! before the wait; there is no asynchronous cancellation.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A coalescing one-bit event with deadline waits.
pub struct Signal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub const fn new() -> Self {
        Self {
            raised: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Raise the signal, waking every waiter. Coalescing: a second
    /// raise before anyone waits changes nothing.
    pub fn raise(&self) {
        let mut raised = self.raised.lock().unwrap_or_else(|e| e.into_inner());
        *raised = true;
        self.cond.notify_all();
    }

    /// Drop a pending raise, if any.
    pub fn clear(&self) {
        let mut raised = self.raised.lock().unwrap_or_else(|e| e.into_inner());
        *raised = false;
    }

    /// Block until the signal is raised or `timeout_ms` elapses.
    ///
    /// Returns `true` if the signal fired (the pending raise is
    /// consumed), `false` on timeout.
    pub fn wait_timeout(&self, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut raised = self.raised.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *raised {
                *raised = false;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(raised, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            raised = guard;
        }
    }

    /// Block until the signal is raised, with no deadline.
    pub fn wait(&self) {
        let mut raised = self.raised.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *raised {
                *raised = false;
                return;
            }
            raised = self
                .cond
                .wait(raised)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
