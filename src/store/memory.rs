//! In-memory counter store.
//!
//! Suitable for single-instance deployments and for testing the decision
//! engine against the same atomic-increment contract the shared store
//! provides. Per-key atomicity comes from the map's entry lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;

use super::{sliding_count, Clock, CounterStore, StoreError, SystemClock, WindowCount};

/// A pair of adjacent window buckets for one key.
#[derive(Debug, Clone, Copy)]
struct BucketPair {
    /// Index of the bucket `current` belongs to (now / window).
    bucket: u64,
    current: u64,
    previous: u64,
}

/// Sliding-window counter store backed by a concurrent map.
pub struct MemoryCounterStore {
    counters: DashMap<String, BucketPair>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    fn window_millis(window: Duration) -> u64 {
        (window.as_millis() as u64).max(1)
    }

    fn resets_at(bucket: u64, window_ms: u64) -> DateTime<Utc> {
        let end_ms = (bucket + 1) * window_ms;
        Utc.timestamp_millis_opt(end_ms as i64)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let window_ms = Self::window_millis(window);
        let now = self.clock.now_millis();
        let bucket = now / window_ms;
        let elapsed = Duration::from_millis(now % window_ms);

        // The entry guard holds the shard lock, making the rotate-and-add
        // sequence atomic with respect to other callers of this key.
        let mut entry = self.counters.entry(key.to_string()).or_insert(BucketPair {
            bucket,
            current: 0,
            previous: 0,
        });

        if entry.bucket != bucket {
            entry.previous = if entry.bucket + 1 == bucket {
                entry.current
            } else {
                0
            };
            entry.current = 0;
            entry.bucket = bucket;
        }
        entry.current += 1;

        let count = sliding_count(entry.current, entry.previous, elapsed, window);
        Ok(WindowCount {
            count,
            resets_at: Self::resets_at(bucket, window_ms),
        })
    }

    async fn get(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let window_ms = Self::window_millis(window);
        let now = self.clock.now_millis();
        let bucket = now / window_ms;
        let elapsed = Duration::from_millis(now % window_ms);

        let Some(entry) = self.counters.get(key) else {
            return Ok(0);
        };

        let (current, previous) = if entry.bucket == bucket {
            (entry.current, entry.previous)
        } else if entry.bucket + 1 == bucket {
            (0, entry.current)
        } else {
            (0, 0)
        };

        Ok(sliding_count(current, previous, elapsed, window))
    }

    async fn reset(&self, key_prefix: &str) -> Result<u64, StoreError> {
        let before = self.counters.len();
        self.counters.retain(|key, _| !key.starts_with(key_prefix));
        Ok(before.saturating_sub(self.counters.len()) as u64)
    }
}
