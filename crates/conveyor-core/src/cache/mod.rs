//! TTL key-value cache layer
//!
//! Short-lived read-through caching for worker records and worker
//! blacklist flags. The cache is never the authoritative source for any
//! invariant: on a miss, callers consult the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

/// Cache result type alias
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Cache namespace for the engine's key families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
    /// Cached worker records
    Worker,

    /// Workers excluded from assignment
    WorkerBlacklist,
}

impl CacheNamespace {
    /// Get the string prefix for this namespace
    pub fn prefix(&self) -> &'static str {
        match self {
            CacheNamespace::Worker => "worker",
            CacheNamespace::WorkerBlacklist => "worker:blacklist",
        }
    }

    /// Create a prefixed key
    pub fn key(&self, key: impl AsRef<str>) -> String {
        format!("{}:{}", self.prefix(), key.as_ref())
    }
}

/// TTL key-value store contract
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Get a value; expired entries read as misses
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Put a value with a TTL
    async fn put(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()>;

    /// Evict a key; returns whether a live entry was removed
    async fn evict(&self, key: &str) -> CacheResult<bool>;
}

struct CacheEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// In-process cache used by the default wiring
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Drop expired entries. Reads already treat them as misses; this
    /// reclaims the memory.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    /// Live entry count
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Utc::now();

        // Read and release the shard guard before any removal
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| CacheError::Backend(format!("ttl out of range: {}", e)))?;
        self.entries.insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn evict(&self, key: &str) -> CacheResult<bool> {
        let now = Utc::now();
        match self.entries.remove(key) {
            Some((_, entry)) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }
}
