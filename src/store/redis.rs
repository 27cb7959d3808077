//! Redis-backed counter store.
//!
//! This is the shared store used when multiple engine instances must agree
//! on quota state. Each key maps to per-bucket Redis counters; the increment
//! uses an atomic `INCR` so concurrent instances never lose updates. Bucket
//! keys expire after two window lengths, which keeps the previous bucket
//! alive long enough for the sliding-window blend and lets idle keys vanish
//! without explicit cleanup.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use super::{sliding_count, CounterStore, StoreError, WindowCount};

/// Configuration for the Redis counter store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix applied to every key, namespacing the store within Redis.
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "floodgate:".to_string(),
        }
    }
}

/// Sliding-window counter store backed by Redis.
pub struct RedisCounterStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
}

impl RedisCounterStore {
    /// Connect to Redis with the default configuration.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with a custom configuration.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        debug!(url = %url, prefix = %config.key_prefix, "Connected to Redis counter store");
        Ok(Self { connection, config })
    }

    fn bucket_keys(prefix: &str, key: &str, window_ms: u64, now_ms: u64) -> (String, String, u64) {
        let bucket = now_ms / window_ms;
        let current = format!("{}{}:{}", prefix, key, bucket);
        let previous = format!("{}{}:{}", prefix, key, bucket.wrapping_sub(1));
        (current, previous, bucket)
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

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let window_ms = Self::window_millis(window);
        let now_ms = Utc::now().timestamp_millis() as u64;
        let (current_key, previous_key, bucket) =
            Self::bucket_keys(&self.config.key_prefix, key, window_ms, now_ms);
        let elapsed = Duration::from_millis(now_ms % window_ms);

        // Keys live for two windows so the previous bucket is still
        // readable while it overlaps the trailing window.
        let ttl_secs = (2 * window_ms / 1000).max(1) as i64;

        let mut conn = self.connection.clone();
        let (current, previous): (u64, Option<u64>) = redis::pipe()
            .atomic()
            .incr(&current_key, 1u64)
            .expire(&current_key, ttl_secs)
            .ignore()
            .get(&previous_key)
            .query_async(&mut conn)
            .await?;

        Ok(WindowCount {
            count: sliding_count(current, previous.unwrap_or(0), elapsed, window),
            resets_at: Self::resets_at(bucket, window_ms),
        })
    }

    async fn get(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let window_ms = Self::window_millis(window);
        let now_ms = Utc::now().timestamp_millis() as u64;
        let (current_key, previous_key, _) =
            Self::bucket_keys(&self.config.key_prefix, key, window_ms, now_ms);
        let elapsed = Duration::from_millis(now_ms % window_ms);

        let mut conn = self.connection.clone();
        let (current, previous): (Option<u64>, Option<u64>) =
            conn.mget((&current_key, &previous_key)).await?;

        Ok(sliding_count(
            current.unwrap_or(0),
            previous.unwrap_or(0),
            elapsed,
            window,
        ))
    }

    async fn reset(&self, key_prefix: &str) -> Result<u64, StoreError> {
        let pattern = format!("{}{}*", self.config.key_prefix, key_prefix);
        let mut conn = self.connection.clone();

        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection.clone();
        let removed: u64 = conn.del(&keys).await?;
        debug!(pattern = %pattern, removed = removed, "Reset counters");
        Ok(removed)
    }
}
