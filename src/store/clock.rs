//! Clock abstraction for window arithmetic.
//!
//! Window expiry tests should not sleep, so the in-memory store takes its
//! notion of "now" from a trait the tests can control.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time, in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }
}
