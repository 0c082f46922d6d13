//! Result cache keyed by task key.
//!
//! A cached, unexpired `WorkResult` lets the dispatcher answer a submission
//! without spawning a worker unit. Entries expire after the configured TTL;
//! an expired entry is indistinguishable from a missing one, so the next
//! submission recomputes and overwrites it.
//!
//! Two implementations share the `ResultCache` contract:
//!
//! - `RedisResultCache`: `SET task:<sourceRef> <json> EX <ttl>` on the shared
//!   Redis instance
//! - `MemoryResultCache`: in-process map with `Instant`-based expiry, for
//!   tests and one-shot runs

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::CacheError;
use crate::scheduler::job::{TaskKey, WorkResult};

/// Contract of the result store.
///
/// Writes are idempotent by task key: the last writer wins.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Returns the unexpired result for a task key, if any.
    async fn get(&self, key: &TaskKey) -> Result<Option<WorkResult>, CacheError>;

    /// Stores a result under its task key for `ttl`.
    async fn put(&self, result: &WorkResult, ttl: Duration) -> Result<(), CacheError>;
}

/// Redis-backed result cache.
pub struct RedisResultCache {
    redis: ConnectionManager,
}

impl RedisResultCache {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CacheError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Creates a cache from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn get(&self, key: &TaskKey) -> Result<Option<WorkResult>, CacheError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(key.as_str()).await?;

        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, result: &WorkResult, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(result)?;

        redis::cmd("SET")
            .arg(result.task_key.as_str())
            .arg(serialized)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }
}

/// Cache entry with expiry metadata.
#[derive(Debug, Clone)]
struct CacheEntry {
    result: WorkResult,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

/// Cache statistics for monitoring and debugging.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Lookups answered with an unexpired result.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Results written.
    pub writes: u64,
    /// Expired entries dropped.
    pub entries_evicted: u64,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0, or 0.0 if there were no lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// In-process result cache using interior mutability with `RwLock`.
#[derive(Default)]
pub struct MemoryResultCache {
    cache: RwLock<HashMap<TaskKey, CacheEntry>>,
    stats: RwLock<CacheStats>,
    failing_puts: AtomicU32,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail, to exercise persistence retries.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Get current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get the number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all expired entries.
    pub fn evict_expired(&self) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let before = cache.len();
        cache.retain(|_, entry| !entry.is_expired());
        let evicted = (before - cache.len()) as u64;
        drop(cache);

        if evicted > 0 {
            let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
            stats.entries_evicted += evicted;
        }
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, key: &TaskKey) -> Result<Option<WorkResult>, CacheError> {
        let found = {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            cache
                .get(key)
                .filter(|entry| !entry.is_expired())
                .map(|entry| entry.result.clone())
        };

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }

        Ok(found)
    }

    async fn put(&self, result: &WorkResult, ttl: Duration) -> Result<(), CacheError> {
        let failing = self.failing_puts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_puts.store(failing - 1, Ordering::SeqCst);
            return Err(CacheError::ConnectionFailed(
                "injected write failure".to_string(),
            ));
        }

        self.evict_expired();

        let entry = CacheEntry {
            result: result.clone(),
            stored_at: Instant::now(),
            ttl,
        };
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(result.task_key.clone(), entry);

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        stats.writes += 1;

        Ok(())
    }
}
