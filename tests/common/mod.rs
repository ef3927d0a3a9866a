//! Common utilities for integration tests
//!
//! Shared fixtures:
//! - test configuration and invalidation rules
//! - cache nodes wired to a shared store and bus
//! - failing and slow L2/bus doubles

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tiered_cache::backends::MemoryStore;
use tiered_cache::{
    Affects, CacheConfig, CacheError, CacheResult, DistributedCache, InvalidationBus,
    InvalidationEvent, InvalidationHandler, InvalidationRules, KeyPattern, LocalBus, Subscription,
    TieredCache, TieredCacheBuilder, async_trait,
};

pub const NAMESPACE: &str = "app-service";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: u32,
    pub name: String,
}

pub fn app(id: u32, name: &str) -> App {
    App {
        id,
        name: name.to_string(),
    }
}

/// Configuration with no background sweeper, so paused-clock tests stay deterministic
pub fn test_config() -> CacheConfig {
    CacheConfig {
        l1_max_entries: 100,
        l1_ttl: Duration::from_secs(10),
        l2_ttl: Duration::from_secs(300),
        sweep_interval: None,
        ..CacheConfig::new(NAMESPACE)
    }
}

pub fn app_rules() -> InvalidationRules {
    InvalidationRules::new()
        .rule(
            "app.updated",
            [
                Affects::detail("app", ["appId"]),
                Affects::related("app", ["appId"], "versions"),
                Affects::related("app", ["appId"], "latest"),
                Affects::lists("apps"),
                Affects::aggregate("apps", "stats"),
            ],
        )
        .rule("app.deleted", [Affects::subtree("app", ["appId"]), Affects::lists("apps")])
}

/// A cache node with the test rules
pub async fn node(
    config: CacheConfig,
    l2: Option<Arc<dyn DistributedCache>>,
    bus: Option<Arc<dyn InvalidationBus>>,
) -> TieredCache<App> {
    let mut builder = TieredCacheBuilder::new(config).with_rules(app_rules());
    if let Some(l2) = l2 {
        builder = builder.with_l2(l2);
    }
    if let Some(bus) = bus {
        builder = builder.with_bus(bus);
    }
    builder
        .build()
        .await
        .unwrap_or_else(|e| panic!("failed to build cache: {e}"))
}

/// Two nodes sharing one in-memory L2 and one in-process bus
pub async fn two_nodes(
    config: CacheConfig,
    bus: LocalBus,
) -> (TieredCache<App>, TieredCache<App>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(bus);
    let a = node(config.clone(), Some(store.clone()), Some(bus.clone())).await;
    let b = node(config, Some(store.clone()), Some(bus)).await;
    (a, b, store)
}

/// Poll `condition` until it holds, sleeping between attempts
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// L2 that is never reachable
pub struct UnreachableStore;

#[async_trait]
impl DistributedCache for UnreachableStore {
    async fn get(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
        Err(CacheError::backend("unreachable", "connection refused"))
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> CacheResult<()> {
        Err(CacheError::backend("unreachable", "connection refused"))
    }

    async fn delete(&self, _key: &str) -> CacheResult<()> {
        Err(CacheError::backend("unreachable", "connection refused"))
    }

    async fn delete_matching(&self, _pattern: &KeyPattern) -> CacheResult<usize> {
        Err(CacheError::backend("unreachable", "connection refused"))
    }

    async fn health_check(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "unreachable"
    }
}

/// L2 answering every call after `delay`
pub struct SlowStore {
    pub inner: MemoryStore,
    pub delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl DistributedCache for SlowStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(key).await
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> CacheResult<usize> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete_matching(pattern).await
    }

    async fn health_check(&self) -> bool {
        tokio::time::sleep(self.delay).await;
        true
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

/// Bus that is down: publishing and subscribing both fail
pub struct FailingBus;

#[async_trait]
impl InvalidationBus for FailingBus {
    async fn publish(&self, _event: &InvalidationEvent) -> CacheResult<()> {
        Err(CacheError::backend("failing-bus", "broker unreachable"))
    }

    async fn subscribe(&self, _handler: Arc<dyn InvalidationHandler>) -> CacheResult<Subscription> {
        Err(CacheError::backend("failing-bus", "broker unreachable"))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}
