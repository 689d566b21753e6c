//! Shared rate-limit store and panic shield.
//!
//! # Purpose
//! Fixed-window request counters keyed by `(slug, path, method, role, ip)`
//! and the per-project panic flag, both held in the shared Redis store so
//! every replica sees the same state. An in-memory backend provides the
//! same semantics for development and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    #[error("rate store error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LimitError {
    fn from(err: redis::RedisError) -> Self {
        LimitError::Backend(err.to_string())
    }
}

/// Outcome of one fixed-window check. `remaining` is already decremented
/// for the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_secs: u64,
}

#[async_trait]
pub trait RateStore: Send + Sync {
    async fn check_rate(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
    ) -> Result<RateDecision, LimitError>;

    async fn set_panic(&self, slug: &str, engaged: bool) -> Result<(), LimitError>;
    async fn is_panicked(&self, slug: &str) -> Result<bool, LimitError>;
}

fn rate_redis_key(key: &str) -> String {
    format!("cascata:rl:{key}")
}

fn panic_redis_key(slug: &str) -> String {
    format!("cascata:panic:{slug}")
}

pub struct RedisRateStore {
    redis: ConnectionManager,
}

impl RedisRateStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl RateStore for RedisRateStore {
    async fn check_rate(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
    ) -> Result<RateDecision, LimitError> {
        let redis_key = rate_redis_key(key);
        let mut conn = self.redis.clone();
        let count: u64 = conn.incr(&redis_key, 1u64).await?;
        if count == 1 {
            let _: () = conn.expire(&redis_key, window_secs as i64).await?;
        }
        let ttl: i64 = conn.ttl(&redis_key).await?;
        let reset_secs = if ttl > 0 { ttl as u64 } else { window_secs };
        Ok(RateDecision {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_secs,
        })
    }

    async fn set_panic(&self, slug: &str, engaged: bool) -> Result<(), LimitError> {
        let mut conn = self.redis.clone();
        if engaged {
            let _: () = conn.set(panic_redis_key(slug), 1u8).await?;
        } else {
            let _: () = conn.del(panic_redis_key(slug)).await?;
        }
        Ok(())
    }

    async fn is_panicked(&self, slug: &str) -> Result<bool, LimitError> {
        let mut conn = self.redis.clone();
        Ok(conn.exists(panic_redis_key(slug)).await?)
    }
}

/// Process-local backend with identical semantics, for dev and tests.
#[derive(Default)]
pub struct MemoryRateStore {
    windows: DashMap<String, (u64, Instant)>,
    panics: DashMap<String, ()>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn check_rate(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
    ) -> Result<RateDecision, LimitError> {
        let window = Duration::from_secs(window_secs);
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert((0, now));
        let (count, started) = *entry;
        let (count, started) = if now.duration_since(started) >= window {
            (1, now)
        } else {
            (count + 1, started)
        };
        *entry = (count, started);
        let elapsed = now.duration_since(started);
        Ok(RateDecision {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_secs: window.saturating_sub(elapsed).as_secs().max(1),
        })
    }

    async fn set_panic(&self, slug: &str, engaged: bool) -> Result<(), LimitError> {
        if engaged {
            self.panics.insert(slug.to_string(), ());
        } else {
            self.panics.remove(slug);
        }
        Ok(())
    }

    async fn is_panicked(&self, slug: &str) -> Result<bool, LimitError> {
        Ok(self.panics.contains_key(slug))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_window_counts_down() {
        let store = MemoryRateStore::new();
        let first = store.check_rate("k", 2, 60).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        let second = store.check_rate("k", 2, 60).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);
        let third = store.check_rate("k", 2, 60).await.unwrap();
        assert!(!third.allowed);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = MemoryRateStore::new();
        store.check_rate("a", 1, 60).await.unwrap();
        let other = store.check_rate("b", 1, 60).await.unwrap();
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn panic_flag_round_trips() {
        let store = MemoryRateStore::new();
        assert!(!store.is_panicked("acme").await.unwrap());
        store.set_panic("acme", true).await.unwrap();
        assert!(store.is_panicked("acme").await.unwrap());
        store.set_panic("acme", false).await.unwrap();
        assert!(!store.is_panicked("acme").await.unwrap());
    }
}
