//! L1 Cache - Bounded In-Process LRU with per-entry TTL
//!
//! Hot tier of the tiered cache. Capacity eviction (least-recently-used) and
//! time expiry are independent: an entry leaves on whichever comes first.
//! Expiry is lazy, checked on read; [`LocalCache::spawn_sweeper`] optionally
//! removes expired entries nobody reads again.
//!
//! The entry map is split into `shards` independent LRU lists, each behind its
//! own lock, so unrelated keys do not contend. With a single shard LRU order
//! is exact across the whole cache; with more, it is exact per shard.

use crate::error::{CacheError, CacheResult};
use crate::keys::KeyPattern;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Fallback lifetime when `now + ttl` overflows the clock
const MAX_LIFETIME: Duration = Duration::from_secs(30 * 365 * 24 * 3600);

/// Cache entry with TTL and access tracking
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    pub last_accessed_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration, now: Instant) -> Self {
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + MAX_LIFETIME);
        Self {
            value,
            inserted_at: now,
            expires_at,
            last_accessed_at: now,
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Entries currently held (including expired ones not yet removed)
    pub size: usize,
    /// Configured capacity
    pub max: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    /// Hits as a percentage of lookups
    pub hit_rate: f64,
    /// Lookups (hits + misses)
    pub total: u64,
}

impl CacheStats {
    /// Hit rate formatted with two decimals, e.g. `66.67%`
    #[must_use]
    pub fn hit_rate_display(&self) -> String {
        format!("{:.2}%", self.hit_rate)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

/// Result of one budgeted pattern sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Entries whose key was compared with the pattern
    pub examined: usize,
    /// Entries removed
    pub removed: usize,
    /// The budget ran out before every entry was examined
    pub exhausted: bool,
}

type Shard<V> = Mutex<LruCache<String, CacheEntry<V>>>;

/// Bounded LRU cache with per-entry TTL
pub struct LocalCache<V> {
    shards: Vec<Shard<V>>,
    hasher: RandomState,
    capacity: usize,
    counters: Counters,
}

impl<V: Clone> LocalCache<V> {
    /// Create a cache holding at most `max_entries` entries in `shards` LRU shards
    ///
    /// The shard count is capped at `max_entries`; shard capacities add up to
    /// exactly `max_entries`.
    ///
    /// # Panics
    ///
    /// Panics if `max_entries` is zero. A zero-capacity L1 is a configuration bug.
    #[must_use]
    pub fn new(max_entries: usize, shards: usize) -> Self {
        assert!(max_entries > 0, "l1_max_entries must be greater than zero");

        let shard_count = shards.clamp(1, max_entries);
        let base = max_entries / shard_count;
        let remainder = max_entries % shard_count;

        let shards = (0..shard_count)
            .map(|i| {
                let cap = base + usize::from(i < remainder);
                Mutex::new(LruCache::new(NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN)))
            })
            .collect();

        info!(
            capacity = max_entries,
            shards = shard_count,
            "L1 Cache initialized"
        );

        Self {
            shards,
            hasher: RandomState::new(),
            capacity: max_entries,
            counters: Counters::default(),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::indexing_slicing)]
    fn shard(&self, key: &str) -> &Shard<V> {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        let idx = self.hasher.hash_one(key) % self.shards.len() as u64;
        &self.shards[idx as usize]
    }

    /// Look up a live entry, touching it on a hit
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut shard = self.shard(key).lock();

        let expired = match shard.peek(key) {
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired_at(now),
        };

        if expired {
            shard.pop(key);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "[L1] Dropped expired entry on read");
            return None;
        }

        let entry = shard.get_mut(key)?;
        entry.last_accessed_at = now;
        let value = entry.value.clone();
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Whether a live entry exists, without touching it or the counters
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.shard(key)
            .lock()
            .peek(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    /// Insert or refresh an entry
    ///
    /// A new key arriving at a full shard first evicts that shard's
    /// least-recently-used entry.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidTtl`] if `ttl` is zero.
    pub fn set(&self, key: &str, value: V, ttl: Duration) -> CacheResult<()> {
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl { ttl });
        }

        let entry = CacheEntry::new(value, ttl, Instant::now());
        let mut shard = self.shard(key).lock();

        if let Some(existing) = shard.get_mut(key) {
            *existing = entry;
        } else {
            if shard.len() >= shard.cap().get() {
                if let Some((evicted, _)) = shard.pop_lru() {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %evicted, "[L1] Evicted least-recently-used entry");
                }
            }
            shard.put(key.to_string(), entry);
        }
        drop(shard);

        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_ms = %ttl.as_millis(), "[L1] Cached key with TTL");
        Ok(())
    }

    /// Remove one entry; `false` if it was not present
    pub fn delete(&self, key: &str) -> bool {
        self.shard(key).lock().pop(key).is_some()
    }

    /// Remove entries matching `pattern`, examining at most `budget` entries
    ///
    /// Entries left unexamined when the budget runs out are only removed by
    /// their own TTL. Exact patterns cost a single lookup.
    pub fn delete_matching(&self, pattern: &KeyPattern, budget: usize) -> SweepOutcome {
        if pattern.is_exact() {
            return SweepOutcome {
                examined: 1,
                removed: usize::from(self.delete(pattern.as_str())),
                exhausted: false,
            };
        }

        let mut outcome = SweepOutcome::default();
        for shard in &self.shards {
            let mut guard = shard.lock();
            let mut doomed = Vec::new();
            for (key, _) in guard.iter() {
                if outcome.examined >= budget {
                    outcome.exhausted = true;
                    break;
                }
                outcome.examined += 1;
                if pattern.matches(key) {
                    doomed.push(key.clone());
                }
            }
            for key in &doomed {
                guard.pop(key.as_str());
            }
            outcome.removed += doomed.len();

            if outcome.exhausted {
                break;
            }
        }

        debug!(
            pattern = %pattern,
            examined = outcome.examined,
            removed = outcome.removed,
            exhausted = outcome.exhausted,
            "[L1] Pattern sweep"
        );
        outcome
    }

    /// Remove every entry; returns how many were held
    pub fn clear(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let mut guard = shard.lock();
                let n = guard.len();
                guard.clear();
                n
            })
            .sum()
    }

    /// Remove every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                let mut guard = shard.lock();
                let expired: Vec<String> = guard
                    .iter()
                    .filter(|(_, entry)| entry.is_expired_at(now))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &expired {
                    guard.pop(key.as_str());
                }
                expired.len()
            })
            .sum()
    }

    /// Entries currently held, expired or not
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            size: self.len(),
            max: self.capacity,
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
            total,
        }
    }

    /// Zero all counters; entries are kept
    pub fn reset_stats(&self) {
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
        self.counters.sets.store(0, Ordering::Relaxed);
        self.counters.evictions.store(0, Ordering::Relaxed);
    }
}

impl<V: Clone + Send + 'static> LocalCache<V> {
    /// Periodically purge expired entries until the cache is dropped
    ///
    /// `every` must be non-zero; [`CacheConfig::validate`](crate::CacheConfig::validate)
    /// rejects a zero `sweep_interval`.
    pub fn spawn_sweeper(cache: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!(count = removed, "[L1] Swept expired entries");
                }
            }
        })
    }
}
