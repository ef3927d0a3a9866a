//! In-memory L2 store
//!
//! A `DashMap` shared by every [`TieredCache`](crate::TieredCache) holding an
//! `Arc` to it. Useful for several caches in one process and for tests.

use crate::error::CacheResult;
use crate::keys::KeyPattern;
use crate::traits::DistributedCache;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Concurrent in-memory store with per-key TTL
///
/// Expired entries are dropped lazily on read; call
/// [`cleanup_expired`](Self::cleanup_expired) to reclaim memory eagerly.
///
/// ```rust
/// use tiered_cache::backends::MemoryStore;
/// use tiered_cache::DistributedCache;
/// use std::time::Duration;
///
/// # async fn example() -> tiered_cache::CacheResult<()> {
/// let store = MemoryStore::new();
/// store.set("app:user:1", b"{\"name\":\"alice\"}", Duration::from_secs(60)).await?;
/// assert!(store.get("app:user:1").await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Initializing in-memory L2 store");
        Self::default()
    }

    /// Remove expired entries, returning how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.map.len());
        if removed > 0 {
            debug!(count = removed, "[L2] Cleaned up expired entries");
        }
        removed
    }

    /// Number of stored entries, expired ones included until cleaned up
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[async_trait]
impl DistributedCache for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let now = Instant::now();
        match self.map.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.bytes.clone())),
            Some(_) => {}
        }
        // The read guard is released here; removing under it would deadlock the shard.
        self.map.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.map.insert(
            key.to_string(),
            StoredValue {
                bytes: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        debug!(key = %key, ttl_ms = ttl.as_millis(), "[L2] Stored key");
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> CacheResult<usize> {
        if pattern.is_exact() {
            return Ok(usize::from(self.map.remove(pattern.as_str()).is_some()));
        }
        let before = self.map.len();
        self.map.retain(|key, _| !pattern.matches(key));
        let removed = before.saturating_sub(self.map.len());
        debug!(pattern = %pattern, count = removed, "[L2] Deleted matching keys");
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
