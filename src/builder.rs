//! Tiered Cache Builder
//!
//! Assembles a [`TieredCache`] from a configuration, invalidation rules and
//! optional L2 store and bus.
//!
//! # Example: L1-only
//!
//! ```rust
//! use tiered_cache::{CacheConfig, TieredCacheBuilder};
//!
//! # async fn example() -> tiered_cache::CacheResult<()> {
//! let cache = TieredCacheBuilder::<String>::new(CacheConfig::new("app-service"))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Redis L2 and Pub/Sub invalidation
//!
//! ```rust,no_run
//! # #[cfg(feature = "redis")]
//! # async fn example() -> tiered_cache::CacheResult<()> {
//! use std::sync::Arc;
//! use tiered_cache::backends::{RedisBus, RedisStore};
//! use tiered_cache::{CacheConfig, InvalidationConfig, TieredCacheBuilder};
//!
//! let cache = TieredCacheBuilder::<serde_json::Value>::new(CacheConfig::from_env()?)
//!     .with_l2(Arc::new(RedisStore::new().await?))
//!     .with_bus(Arc::new(RedisBus::new(InvalidationConfig::default()).await?))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::TieredCache;
use crate::codecs::JsonCodec;
use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::invalidation::{AtomicInvalidationStats, LocalInvalidator};
use crate::keys::{InvalidationRules, KeyBuilder};
use crate::l1_cache::LocalCache;
use crate::traits::{CacheCodec, DistributedCache, InvalidationBus};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Builder for [`TieredCache`]
///
/// Without [`with_l2`](Self::with_l2) the cache runs L1-only; without
/// [`with_bus`](Self::with_bus) peers are never told about invalidations and
/// rely on their L1 TTL.
pub struct TieredCacheBuilder<V, C = JsonCodec> {
    config: CacheConfig,
    rules: InvalidationRules,
    l2: Option<Arc<dyn DistributedCache>>,
    bus: Option<Arc<dyn InvalidationBus>>,
    codec: C,
    _value: PhantomData<fn() -> V>,
}

impl<V> TieredCacheBuilder<V, JsonCodec> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            rules: InvalidationRules::new(),
            l2: None,
            bus: None,
            codec: JsonCodec,
            _value: PhantomData,
        }
    }
}

impl<V, C> TieredCacheBuilder<V, C> {
    /// Invalidation rules used by [`TieredCache::invalidate`]
    #[must_use]
    pub fn with_rules(mut self, rules: InvalidationRules) -> Self {
        self.rules = rules;
        self
    }

    /// Shared L2 store
    #[must_use]
    pub fn with_l2(mut self, store: Arc<dyn DistributedCache>) -> Self {
        self.l2 = Some(store);
        self
    }

    /// Invalidation bus shared with every peer
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Codec for values stored in L2
    pub fn with_codec<C2: CacheCodec>(self, codec: C2) -> TieredCacheBuilder<V, C2> {
        TieredCacheBuilder {
            config: self.config,
            rules: self.rules,
            l2: self.l2,
            bus: self.bus,
            codec,
            _value: PhantomData,
        }
    }
}

impl<V, C> TieredCacheBuilder<V, C>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    C: CacheCodec,
{
    /// Validate the configuration, subscribe to the bus and start the sweeper
    ///
    /// A failed bus subscription is not fatal: the cache starts without
    /// remote invalidation and logs a warning.
    ///
    /// # Errors
    ///
    /// Returns the [`CacheConfig::validate`] error for an invalid configuration.
    ///
    /// # Panics
    ///
    /// If `l1_max_entries` is zero.
    pub async fn build(self) -> CacheResult<TieredCache<V, C>> {
        self.config.validate()?;

        let keys = KeyBuilder::new(&self.config.namespace).with_rules(self.rules);
        let l1: Arc<LocalCache<Option<V>>> = Arc::new(LocalCache::new(
            self.config.l1_max_entries,
            self.config.l1_shards,
        ));
        let origin_id = Uuid::new_v4().to_string();
        let invalidation = Arc::new(AtomicInvalidationStats::default());

        let subscription = match &self.bus {
            Some(bus) => {
                let handler = Arc::new(LocalInvalidator::new(
                    Arc::clone(&l1),
                    origin_id.clone(),
                    self.config.apply_own_events,
                    self.config.sweep_budget_per_invalidation,
                    Arc::clone(&invalidation),
                ));
                match bus.subscribe(handler).await {
                    Ok(subscription) => Some(subscription),
                    Err(e) => {
                        warn!(bus = bus.name(), error = %e, "[Bus] Subscribe failed, running without remote invalidation");
                        None
                    }
                }
            }
            None => None,
        };

        let sweeper = self
            .config
            .sweep_interval
            .map(|every| LocalCache::spawn_sweeper(&l1, every));

        info!(
            namespace = %self.config.namespace,
            l1_max_entries = self.config.l1_max_entries,
            l2 = self.l2.as_ref().map_or("none", |l2| l2.name()),
            bus = self.bus.as_ref().map_or("none", |bus| bus.name()),
            codec = self.codec.name(),
            origin = %origin_id,
            "Tiered cache initialized"
        );

        Ok(TieredCache::from_parts(
            self.config,
            keys,
            self.codec,
            l1,
            self.l2,
            self.bus,
            origin_id,
            invalidation,
            subscription,
            sweeper,
        ))
    }
}
