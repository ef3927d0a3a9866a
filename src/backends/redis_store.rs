//! Redis L2 store
//!
//! Shared warm tier reachable by every instance, with millisecond TTLs.

use crate::error::{CacheError, CacheResult};
use crate::keys::KeyPattern;
use crate::traits::DistributedCache;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::{debug, info};

const BACKEND: &str = "redis";

/// Keys fetched per `SCAN` round trip
const SCAN_COUNT: usize = 100;

/// Redis store with `ConnectionManager` for automatic reconnection
#[derive(Clone)]
pub struct RedisStore {
    conn_manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to `REDIS_URL`, defaulting to `redis://127.0.0.1:6379`
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::BackendUnavailable`] if the connection cannot be established.
    pub async fn new() -> CacheResult<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self::with_url(&redis_url).await
    }

    /// Connect to a Redis server
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::BackendUnavailable`] if the URL is invalid, the
    /// connection fails or the server does not answer `PING`.
    pub async fn with_url(redis_url: &str) -> CacheResult<Self> {
        info!(redis_url = %redis_url, "Initializing Redis L2 store");

        let client = Client::open(redis_url).map_err(|e| CacheError::backend(BACKEND, e))?;
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::backend(BACKEND, e))?;

        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::backend(BACKEND, e))?;

        info!(redis_url = %redis_url, "Redis L2 store connected");
        Ok(Self { conn_manager })
    }

    /// Keys matching `pattern`, collected with cursor-based `SCAN`
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::BackendUnavailable`] if a Redis command fails.
    pub async fn scan_keys(&self, pattern: &KeyPattern) -> CacheResult<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let glob = to_redis_glob(pattern);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&glob)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::backend(BACKEND, e))?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }
}

/// Redis glob for a pattern: every metacharacter escaped except the trailing `*`
fn to_redis_glob(pattern: &KeyPattern) -> String {
    let mut glob = String::with_capacity(pattern.as_str().len() + 4);
    for c in pattern.prefix().chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\' | '^') {
            glob.push('\\');
        }
        glob.push(c);
    }
    if !pattern.is_exact() {
        glob.push('*');
    }
    glob
}

#[async_trait]
impl DistributedCache for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| CacheError::backend(BACKEND, e))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn_manager.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let _: () = redis::cmd("PSETEX")
            .arg(key)
            .arg(ttl_ms)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::backend(BACKEND, e))?;
        debug!(key = %key, ttl_ms = ttl_ms, "[Redis] Cached key with TTL");
        Ok(())
    }

    async fn get_many(&self, keys: &[&str]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn_manager.clone();
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::backend(BACKEND, e))
    }

    async fn set_many(&self, entries: &[(&str, &[u8], Duration)]) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn_manager.clone();
        let mut pipe = redis::pipe();
        for (key, value, ttl) in entries {
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            pipe.cmd("PSETEX").arg(*key).arg(ttl_ms).arg(*value).ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::backend(BACKEND, e))?;
        debug!(count = entries.len(), "[Redis] Cached keys in one pipeline");
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| CacheError::backend(BACKEND, e))?;
        Ok(())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> CacheResult<usize> {
        let mut conn = self.conn_manager.clone();
        if pattern.is_exact() {
            return conn
                .del(pattern.as_str())
                .await
                .map_err(|e| CacheError::backend(BACKEND, e));
        }

        let keys = self.scan_keys(pattern).await?;
        let mut removed = 0;
        for chunk in keys.chunks(SCAN_COUNT) {
            let count: usize = conn
                .del(chunk)
                .await
                .map_err(|e| CacheError::backend(BACKEND, e))?;
            removed += count;
        }
        debug!(pattern = %pattern, count = removed, "[Redis] Deleted matching keys");
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn_manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
