//! Shared window counter storage.
//!
//! All mutable quota state lives behind the [`CounterStore`] trait so the
//! decision engine can run against an in-process map in tests and a shared
//! networked store in production without changing the counting algorithm.

mod clock;
mod memory;
mod redis;

pub use clock::{Clock, SystemClock};
#[cfg(test)]
pub(crate) use clock::mock::MockClock;
pub use memory::MemoryCounterStore;
pub use redis::{RedisCounterStore, RedisStoreConfig};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result of an atomic increment against a window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// The count observed by this increment, including the increment itself.
    pub count: u64,
    /// When the current window bucket rolls over.
    pub resets_at: DateTime<Utc>,
}

/// Errors produced by a counter store.
///
/// A store never silently returns zero: if the backend cannot be reached
/// the operation fails with `Unavailable` and the caller decides whether
/// to fail open or closed.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured deadline.
    #[error("Counter store timed out after {0:?}")]
    Timeout(Duration),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Trait for atomic, window-scoped counters keyed by string.
///
/// Implementations use a sliding-window counter: events land in fixed
/// buckets of `window` length and the reported count blends the current
/// bucket with the still-overlapping share of the previous one. The
/// increment and the read of the resulting count are a single atomic
/// operation per key, so concurrent callers can never both observe a
/// pre-increment count.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter for `key` and return the resulting
    /// count together with the time the current bucket resets.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    /// Read the current count for `key` without mutating it.
    async fn get(&self, key: &str, window: Duration) -> Result<u64, StoreError>;

    /// Administratively clear all counters whose key starts with `key_prefix`.
    ///
    /// Returns the number of entries removed.
    async fn reset(&self, key_prefix: &str) -> Result<u64, StoreError>;
}

/// Compute the sliding-window count from the current and previous bucket.
///
/// The previous bucket contributes the fraction of it that still overlaps
/// the trailing window ending now. `elapsed_in_bucket` is how far into the
/// current bucket we are.
pub(crate) fn sliding_count(
    current: u64,
    previous: u64,
    elapsed_in_bucket: Duration,
    window: Duration,
) -> u64 {
    let window_ms = window.as_millis().max(1) as u64;
    let elapsed_ms = (elapsed_in_bucket.as_millis() as u64).min(window_ms);
    let overlap_ms = window_ms - elapsed_ms;
    current + previous * overlap_ms / window_ms
}
