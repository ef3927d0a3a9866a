//! Tiered Cache - Unified Cache Operations
//!
//! Composes the key builder, the process-local L1, an optional shared L2 and
//! an optional invalidation bus behind one `get`/`set`/`delete`/`invalidate` API.
//!
//! Reads go L1 → L2 → caller. Writes go L1 then L2, so a reader right after a
//! local write sees the new value even when L2 is slow. Invalidations purge
//! L1, then L2, then broadcast the same keys and patterns to every peer.
//!
//! L2 and the bus never fail a caller: every failure is logged, counted and
//! degraded. With the bus down, a peer may serve a stale entry until its L1
//! TTL runs out.

use crate::codecs::JsonCodec;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::invalidation::{AtomicInvalidationStats, InvalidationEvent, InvalidationStats, Subscription};
use crate::keys::{CacheKey, InvalidationPlan, KeyBuilder, KeyPattern, dedup_keys};
use crate::l1_cache::{CacheStats, LocalCache};
use crate::traits::{CacheCodec, DistributedCache, InvalidationBus};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// RAII cleanup guard for in-flight request tracking
/// Ensures that entries are removed from `DashMap` even on early return or panic
struct CleanupGuard<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Exclusive right to load one key; the map entry is removed before the lock is released
struct LoadSlot<'a> {
    _cleanup: CleanupGuard<'a>,
    _lock: OwnedMutexGuard<()>,
}

/// What the tiers know about a key
enum Lookup<V> {
    Hit(V),
    /// The source was found to have no value
    Absent,
    Miss,
}

/// Counters of the tiers behind L1
#[derive(Debug, Default)]
struct TierCounters {
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_errors: AtomicU64,
    backfills: AtomicU64,
    coalesced: AtomicU64,
}

impl TierCounters {
    fn reset(&self) {
        for counter in [
            &self.l2_hits,
            &self.l2_misses,
            &self.l2_errors,
            &self.backfills,
            &self.coalesced,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Statistics across every tier
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TieredStats {
    pub l1: CacheStats,
    pub l2_hits: u64,
    pub l2_misses: u64,
    /// L2 calls that failed, timed out or returned an undecodable value
    pub l2_errors: u64,
    /// L2 hits copied into L1
    pub backfills: u64,
    /// `get_or_load` calls answered by a concurrent load of the same key
    pub coalesced: u64,
    pub in_flight: usize,
    pub invalidation: InvalidationStats,
}

/// Result of [`TieredCache::health_check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStatus {
    /// L2 reachability, `None` without an L2
    pub l2: Option<bool>,
    /// Whether a bus subscription is running, `None` without a bus
    pub bus: Option<bool>,
}

impl HealthStatus {
    /// The cache serves, but with reduced hit rate or a wider staleness bound
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.l2 == Some(false) || self.bus == Some(false)
    }
}

impl Serialize for HealthStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("HealthStatus", 3)?;
        state.serialize_field("l2", &self.l2)?;
        state.serialize_field("bus", &self.bus)?;
        state.serialize_field("degraded", &self.is_degraded())?;
        state.end()
    }
}

/// Shared handles used by the facade and its delayed purge tasks
struct Tiers<V> {
    l1: Arc<LocalCache<Option<V>>>,
    l2: Option<Arc<dyn DistributedCache>>,
    bus: Option<Arc<dyn InvalidationBus>>,
    origin_id: Arc<str>,
    l2_timeout: Duration,
    sweep_budget: usize,
    counters: Arc<TierCounters>,
    invalidation: Arc<AtomicInvalidationStats>,
}

impl<V> Clone for Tiers<V> {
    fn clone(&self) -> Self {
        Self {
            l1: Arc::clone(&self.l1),
            l2: self.l2.clone(),
            bus: self.bus.clone(),
            origin_id: Arc::clone(&self.origin_id),
            l2_timeout: self.l2_timeout,
            sweep_budget: self.sweep_budget,
            counters: Arc::clone(&self.counters),
            invalidation: Arc::clone(&self.invalidation),
        }
    }
}

impl<V: Clone + Send + 'static> Tiers<V> {
    /// Run one L2 call under the L2 timeout; `None` means it failed and was logged
    async fn l2_call<T>(
        &self,
        op: &'static str,
        target: &str,
        call: impl Future<Output = CacheResult<T>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.l2_timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.l2_failed(op, target, &e);
                None
            }
            Err(_) => {
                self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    op = op,
                    key = %target,
                    timeout_ms = self.l2_timeout.as_millis(),
                    "[L2] Call timed out, degrading"
                );
                None
            }
        }
    }

    fn l2_failed(&self, op: &'static str, target: &str, error: &CacheError) {
        self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
        warn!(op = op, key = %target, error = %error, "[L2] Call failed, degrading");
    }

    /// Purge L1 and L2 and broadcast the plan; returns the number of L1 entries removed
    ///
    /// The whole L2 phase shares one `l2_timeout`, however many keys and
    /// patterns the plan holds.
    async fn apply(&self, plan: &InvalidationPlan) -> usize {
        let mut removed = 0;
        for key in &plan.keys {
            removed += usize::from(self.l1.delete(key.as_str()));
        }
        for pattern in &plan.patterns {
            let outcome = self.l1.delete_matching(pattern, self.sweep_budget);
            if outcome.exhausted {
                warn!(
                    pattern = %pattern,
                    examined = outcome.examined,
                    "[L1] Sweep budget exhausted, remaining matches expire by TTL"
                );
            }
            removed += outcome.removed;
        }

        if let Some(l2) = &self.l2 {
            let purge = async {
                for key in &plan.keys {
                    if let Err(e) = l2.delete(key.as_str()).await {
                        self.l2_failed("delete", key.as_str(), &e);
                    }
                }
                for pattern in &plan.patterns {
                    match l2.delete_matching(pattern).await {
                        Ok(count) => debug!(pattern = %pattern, count = count, "[L2] Purged pattern"),
                        Err(e) => self.l2_failed("delete_matching", pattern.as_str(), &e),
                    }
                }
            };
            if tokio::time::timeout(self.l2_timeout, purge).await.is_err() {
                self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    keys = plan.keys.len(),
                    patterns = plan.patterns.len(),
                    timeout_ms = self.l2_timeout.as_millis(),
                    "[L2] Purge timed out, remaining entries expire by TTL"
                );
            }
        }

        self.publish(plan).await;
        removed
    }

    async fn publish(&self, plan: &InvalidationPlan) {
        let Some(bus) = &self.bus else {
            return;
        };
        if plan.is_empty() {
            return;
        }

        let event = InvalidationEvent::new(&*self.origin_id, &plan.keys, &plan.patterns);
        let result = match tokio::time::timeout(self.l2_timeout, bus.publish(&event)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::backend(bus.name(), "publish timed out")),
        };
        match result {
            Ok(()) => {
                self.invalidation.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    keys = event.keys.len(),
                    patterns = event.patterns.len(),
                    "[Bus] Published invalidation"
                );
            }
            Err(e) => {
                self.invalidation.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "[Bus] Publish failed, peers stay stale until TTL");
            }
        }
    }
}

/// Tiered cache facade
///
/// Built with [`TieredCacheBuilder`](crate::TieredCacheBuilder). Values are
/// kept as `V` in L1 and encoded with `C` for L2.
pub struct TieredCache<V, C = JsonCodec> {
    config: CacheConfig,
    keys: KeyBuilder,
    codec: C,
    tiers: Tiers<V>,
    /// In-flight loads, one mutex per key being loaded
    in_flight_requests: DashMap<String, Arc<Mutex<()>>>,
    subscription: SyncMutex<Option<Subscription>>,
    sweeper: SyncMutex<Option<JoinHandle<()>>>,
    /// Pending delayed second purges
    purges: SyncMutex<Vec<JoinHandle<()>>>,
}

impl<V, C> TieredCache<V, C>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    C: CacheCodec,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        config: CacheConfig,
        keys: KeyBuilder,
        codec: C,
        l1: Arc<LocalCache<Option<V>>>,
        l2: Option<Arc<dyn DistributedCache>>,
        bus: Option<Arc<dyn InvalidationBus>>,
        origin_id: String,
        invalidation: Arc<AtomicInvalidationStats>,
        subscription: Option<Subscription>,
        sweeper: Option<JoinHandle<()>>,
    ) -> Self {
        let tiers = Tiers {
            l1,
            l2,
            bus,
            origin_id: origin_id.into(),
            l2_timeout: config.l2_timeout,
            sweep_budget: config.sweep_budget_per_invalidation,
            counters: Arc::new(TierCounters::default()),
            invalidation,
        };
        Self {
            config,
            keys,
            codec,
            tiers,
            in_flight_requests: DashMap::new(),
            subscription: SyncMutex::new(subscription),
            sweeper: SyncMutex::new(sweeper),
            purges: SyncMutex::new(Vec::new()),
        }
    }

    /// Key builder for this cache's namespace and invalidation rules
    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Identifier stamped on every invalidation event this instance publishes
    pub fn origin_id(&self) -> &str {
        &self.tiers.origin_id
    }

    /// Direct access to the L1 tier; `None` values are absent markers
    pub fn local(&self) -> &LocalCache<Option<V>> {
        &self.tiers.l1
    }

    /// Get a value, falling back to L2 and back-filling L1 on an L2 hit
    ///
    /// A full miss returns `None`; the caller fetches from the source of truth
    /// and calls [`set`](Self::set). A cached absent marker also reads as `None`.
    pub async fn get(&self, key: &CacheKey) -> Option<V> {
        match self.lookup(key).await {
            Lookup::Hit(value) => Some(value),
            Lookup::Absent | Lookup::Miss => None,
        }
    }

    /// Whether a live value is cached in L1 or L2
    ///
    /// Absent markers do not count. An L2 hit is back-filled into L1 the same
    /// way [`get`](Self::get) does it.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        matches!(self.lookup(key).await, Lookup::Hit(_))
    }

    async fn lookup(&self, key: &CacheKey) -> Lookup<V> {
        if let Some(cached) = self.tiers.l1.get(key.as_str()) {
            return cached.map_or(Lookup::Absent, Lookup::Hit);
        }

        let Some(l2) = &self.tiers.l2 else {
            return Lookup::Miss;
        };
        let Some(bytes) = self
            .tiers
            .l2_call("get", key.as_str(), l2.get(key.as_str()))
            .await
            .flatten()
        else {
            self.tiers.counters.l2_misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss;
        };
        self.decode_and_backfill(key, &bytes)
    }

    fn decode_and_backfill(&self, key: &CacheKey, bytes: &[u8]) -> Lookup<V> {
        match self.codec.deserialize::<Option<V>>(bytes) {
            Ok(value) => {
                self.tiers.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                let lookup = value.clone().map_or(Lookup::Absent, Lookup::Hit);
                self.backfill(key, value);
                lookup
            }
            Err(e) => {
                self.tiers.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, codec = self.codec.name(), error = %e, "[L2] Undecodable value, treating as miss");
                Lookup::Miss
            }
        }
    }

    fn backfill(&self, key: &CacheKey, value: Option<V>) {
        let ttl = match value {
            Some(_) => self.config.l1_ttl,
            None => self.absent_l1_ttl(),
        };
        match self.tiers.l1.set(key.as_str(), value, ttl) {
            Ok(()) => {
                self.tiers.counters.backfills.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "[L1] Back-filled from L2");
            }
            Err(e) => warn!(key = %key, error = %e, "[L1] Back-fill rejected"),
        }
    }

    fn absent_l1_ttl(&self) -> Duration {
        self.config.null_value_ttl.min(self.config.l1_ttl)
    }

    /// Get several values at once, one slot per requested key, in request order
    ///
    /// L1 answers what it holds; the remaining keys go to L2 in one batch
    /// under one `l2_timeout` and are back-filled.
    pub async fn get_many(&self, keys: &[CacheKey]) -> Vec<Option<V>> {
        let mut values = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        for (index, key) in keys.iter().enumerate() {
            match self.tiers.l1.get(key.as_str()) {
                Some(cached) => values.push(cached),
                None => {
                    values.push(None);
                    missing.push((index, key));
                }
            }
        }

        let Some(l2) = &self.tiers.l2 else {
            return values;
        };
        if missing.is_empty() {
            return values;
        }

        let names: Vec<&str> = missing.iter().map(|(_, key)| key.as_str()).collect();
        let target = format!("{} keys", names.len());
        let Some(fetched) = self
            .tiers
            .l2_call("get_many", &target, l2.get_many(&names))
            .await
        else {
            return values;
        };

        for ((index, key), bytes) in missing.into_iter().zip(fetched) {
            let lookup = match bytes {
                Some(bytes) => self.decode_and_backfill(key, &bytes),
                None => {
                    self.tiers.counters.l2_misses.fetch_add(1, Ordering::Relaxed);
                    Lookup::Miss
                }
            };
            if let (Lookup::Hit(value), Some(slot)) = (lookup, values.get_mut(index)) {
                *slot = Some(value);
            }
        }
        values
    }

    async fn load_slot(&self, key: &CacheKey) -> LoadSlot<'_> {
        let key_owned = key.as_str().to_string();
        let lock = self
            .in_flight_requests
            .entry(key_owned.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let lock = lock.lock_owned().await;
        LoadSlot {
            _cleanup: CleanupGuard {
                map: &self.in_flight_requests,
                key: key_owned,
            },
            _lock: lock,
        }
    }

    /// Get a value or load it with `loader`, caching the result
    ///
    /// Concurrent calls for the same missing key run `loader` once; the others
    /// wait and read the cached result. Loader errors are returned unchanged and
    /// nothing is cached; cache failures only cost a reload. An absent marker
    /// does not stop `loader` from running.
    ///
    /// # Errors
    ///
    /// Whatever `loader` returns.
    pub async fn get_or_load<F, Fut, E>(&self, key: &CacheKey, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Lookup::Hit(value) = self.lookup(key).await {
            return Ok(value);
        }

        let _slot = self.load_slot(key).await;

        // Another caller may have loaded the value while we waited
        if let Some(Some(value)) = self.tiers.l1.get(key.as_str()) {
            self.tiers.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        debug!(key = %key, "Loading from source (stampede protected)");
        let value = loader().await?;
        if let Err(e) = self.set(key, value.clone()).await {
            warn!(key = %key, error = %e, "Failed to cache loaded value");
        }
        Ok(value)
    }

    /// Like [`get_or_load`](Self::get_or_load) for sources that may have no value
    ///
    /// A `None` from `loader` is cached as an absent marker for
    /// `null_value_ttl`, so repeated lookups of a missing entity stop reaching
    /// the source. Values of `V` must not encode to the codec's null.
    ///
    /// # Errors
    ///
    /// Whatever `loader` returns.
    pub async fn get_or_load_optional<F, Fut, E>(&self, key: &CacheKey, loader: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        match self.lookup(key).await {
            Lookup::Hit(value) => return Ok(Some(value)),
            Lookup::Absent => return Ok(None),
            Lookup::Miss => {}
        }

        let _slot = self.load_slot(key).await;

        if let Some(cached) = self.tiers.l1.get(key.as_str()) {
            self.tiers.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }

        debug!(key = %key, "Loading optional value from source (stampede protected)");
        let loaded = loader().await?;
        let stored = match &loaded {
            Some(value) => self.set(key, value.clone()).await,
            None => self.set_absent(key).await,
        };
        if let Err(e) = stored {
            warn!(key = %key, error = %e, "Failed to cache loaded value");
        }
        Ok(loaded)
    }

    /// Store a value with the configured L1 and L2 TTLs
    ///
    /// # Errors
    ///
    /// [`CacheError::Codec`] if the value cannot be encoded for L2.
    pub async fn set(&self, key: &CacheKey, value: V) -> CacheResult<()> {
        self.set_with_ttl(key, value, self.config.l1_ttl, self.config.l2_ttl)
            .await
    }

    /// Store a value in L1 then L2 with explicit TTLs
    ///
    /// L2 failures are logged and do not fail the call.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidTtl`] if either TTL is zero, before anything is
    /// written; [`CacheError::Codec`] if the value cannot be encoded for L2.
    pub async fn set_with_ttl(
        &self,
        key: &CacheKey,
        value: V,
        l1_ttl: Duration,
        l2_ttl: Duration,
    ) -> CacheResult<()> {
        for ttl in [l1_ttl, l2_ttl] {
            if ttl.is_zero() {
                return Err(CacheError::InvalidTtl { ttl });
            }
        }
        self.store(key, Some(value), l1_ttl, l2_ttl).await
    }

    /// Record that the source has no value for `key`
    ///
    /// Reads answer `None` without reaching the source until the marker
    /// expires: `null_value_ttl` in L2, at most `l1_ttl` in L1. A later `set`
    /// or invalidation replaces it.
    ///
    /// # Errors
    ///
    /// [`CacheError::Codec`] if the codec cannot encode the marker.
    pub async fn set_absent(&self, key: &CacheKey) -> CacheResult<()> {
        self.store(key, None, self.absent_l1_ttl(), self.config.null_value_ttl)
            .await
    }

    async fn store(
        &self,
        key: &CacheKey,
        value: Option<V>,
        l1_ttl: Duration,
        l2_ttl: Duration,
    ) -> CacheResult<()> {
        let encoded = match &self.tiers.l2 {
            Some(_) => Some(self.encode(value.as_ref())?),
            None => None,
        };

        self.tiers.l1.set(key.as_str(), value, l1_ttl)?;

        if let (Some(l2), Some(bytes)) = (&self.tiers.l2, encoded) {
            let ttl = l2_ttl + jitter(self.config.ttl_jitter);
            self.tiers
                .l2_call("set", key.as_str(), l2.set(key.as_str(), &bytes, ttl))
                .await;
        }
        Ok(())
    }

    fn encode(&self, value: Option<&V>) -> CacheResult<Vec<u8>> {
        self.codec
            .serialize(&value)
            .map_err(|e| CacheError::Codec(format!("{e:#}")))
    }

    /// Store several values with the configured TTLs, writing L2 in one batch
    ///
    /// # Errors
    ///
    /// [`CacheError::Codec`] if any value cannot be encoded, before anything is written.
    pub async fn set_many<I>(&self, entries: I) -> CacheResult<()>
    where
        I: IntoIterator<Item = (CacheKey, V)>,
    {
        let entries: Vec<(CacheKey, Option<V>)> = entries
            .into_iter()
            .map(|(key, value)| (key, Some(value)))
            .collect();
        let encoded = match &self.tiers.l2 {
            Some(_) => entries
                .iter()
                .map(|(_, value)| self.encode(value.as_ref()))
                .collect::<CacheResult<Vec<_>>>()?,
            None => Vec::new(),
        };

        let mut keys = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            self.tiers.l1.set(key.as_str(), value, self.config.l1_ttl)?;
            keys.push(key);
        }

        if let Some(l2) = &self.tiers.l2 {
            let batch: Vec<(&str, &[u8], Duration)> = keys
                .iter()
                .zip(&encoded)
                .map(|(key, bytes)| {
                    (
                        key.as_str(),
                        bytes.as_slice(),
                        self.config.l2_ttl + jitter(self.config.ttl_jitter),
                    )
                })
                .collect();
            let target = format!("{} keys", batch.len());
            self.tiers
                .l2_call("set_many", &target, l2.set_many(&batch))
                .await;
        }
        Ok(())
    }

    /// Remove one key from L1 and L2 and tell every peer
    pub async fn delete(&self, key: &CacheKey) {
        let plan = InvalidationPlan {
            keys: vec![key.clone()],
            patterns: Vec::new(),
        };
        self.tiers.apply(&plan).await;
    }

    /// Invalidate everything `mutation` makes stale
    ///
    /// Purges L1, then L2, then publishes the plan without waiting for peers.
    /// With `double_delete_delay` set, the same purge runs once more after the
    /// delay to catch values back-filled from a stale read in between.
    ///
    /// # Errors
    ///
    /// [`CacheError::UnknownMutation`] if no rule covers `mutation`.
    pub async fn invalidate<I, K, P>(&self, mutation: &str, affected: I) -> CacheResult<InvalidationPlan>
    where
        I: IntoIterator<Item = (K, P)>,
        K: AsRef<str>,
        P: AsRef<str>,
    {
        let plan = self.keys.invalidation_keys_for(mutation, affected)?;
        let removed = self.tiers.apply(&plan).await;
        debug!(
            mutation = %mutation,
            keys = plan.keys.len(),
            patterns = plan.patterns.len(),
            l1_removed = removed,
            "Invalidated"
        );
        self.schedule_second_purge(&plan);
        Ok(plan)
    }

    /// Invalidate explicit keys and patterns; returns the number of L1 entries removed
    pub async fn invalidate_keys(&self, keys: &[CacheKey], patterns: &[KeyPattern]) -> usize {
        let mut plan = InvalidationPlan {
            keys: dedup_keys(keys),
            patterns: Vec::with_capacity(patterns.len()),
        };
        for pattern in patterns {
            if !plan.patterns.contains(pattern) {
                plan.patterns.push(pattern.clone());
            }
        }
        let removed = self.tiers.apply(&plan).await;
        self.schedule_second_purge(&plan);
        removed
    }

    /// Invalidate every key matching a glob; returns the number of L1 entries removed
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidKeyPattern`] if `pattern` is malformed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let pattern = KeyPattern::parse(pattern)?;
        Ok(self.invalidate_keys(&[], &[pattern]).await)
    }

    fn schedule_second_purge(&self, plan: &InvalidationPlan) {
        let Some(delay) = self.config.double_delete_delay else {
            return;
        };
        if plan.is_empty() {
            return;
        }
        let tiers = self.tiers.clone();
        let plan = plan.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let removed = tiers.apply(&plan).await;
            debug!(l1_removed = removed, "Second purge done");
        });
        let mut purges = self.purges.lock();
        purges.retain(|pending| !pending.is_finished());
        purges.push(task);
    }

    /// Drop every L1 entry of this instance only; returns how many were dropped
    pub fn clear(&self) -> usize {
        let dropped = self.tiers.l1.clear();
        info!(dropped = dropped, "[L1] Cleared");
        dropped
    }

    /// Drop the whole namespace: local L1, shared L2 and every peer's L1
    pub async fn flush(&self) -> usize {
        let plan = InvalidationPlan {
            keys: Vec::new(),
            patterns: vec![self.keys.namespace_pattern()],
        };
        let dropped = self.tiers.l1.clear();
        self.tiers.apply(&plan).await;
        info!(namespace = %self.keys.namespace(), dropped = dropped, "Flushed namespace");
        dropped
    }

    /// L1 statistics
    pub fn stats(&self) -> CacheStats {
        self.tiers.l1.stats()
    }

    pub fn tier_stats(&self) -> TieredStats {
        let counters = &self.tiers.counters;
        TieredStats {
            l1: self.tiers.l1.stats(),
            l2_hits: counters.l2_hits.load(Ordering::Relaxed),
            l2_misses: counters.l2_misses.load(Ordering::Relaxed),
            l2_errors: counters.l2_errors.load(Ordering::Relaxed),
            backfills: counters.backfills.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            in_flight: self.in_flight_requests.len(),
            invalidation: self.tiers.invalidation.snapshot(),
        }
    }

    /// Reset every counter; cached entries are kept
    pub fn reset_stats(&self) {
        self.tiers.l1.reset_stats();
        self.tiers.counters.reset();
        self.tiers.invalidation.reset();
    }

    pub async fn health_check(&self) -> HealthStatus {
        let l2 = match &self.tiers.l2 {
            Some(l2) => Some(
                tokio::time::timeout(self.config.l2_timeout, l2.health_check())
                    .await
                    .unwrap_or(false),
            ),
            None => None,
        };
        let bus = self.tiers.bus.as_ref().map(|_| {
            self.subscription
                .lock()
                .as_ref()
                .is_some_and(|sub| !sub.is_finished())
        });
        HealthStatus { l2, bus }
    }

    /// Stop the bus subscription, the background sweeper and pending second purges
    pub async fn shutdown(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.cancel().await;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        for pending in self.purges.lock().drain(..) {
            pending.abort();
        }
        info!(origin = %self.tiers.origin_id, "Tiered cache shut down");
    }
}

impl<V, C> Drop for TieredCache<V, C> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
        for pending in self.purges.get_mut().drain(..) {
            pending.abort();
        }
    }
}

/// Random extra TTL in `[0, max]`
fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
