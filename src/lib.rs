//! Tiered Cache
//!
//! A coherence-bounded, two-tier cache for services running many instances:
//! - **L1**: bounded in-process LRU with per-entry TTL
//! - **L2**: shared store (Redis, or in-memory) consulted on L1 misses
//! - **Invalidation bus**: broadcasts purged keys and patterns so every
//!   instance's L1 drops stale entries
//! - **Key builder**: one place that derives both read keys and the keys a
//!   mutation makes stale
//! - **Stampede protection**: concurrent loads of one missing key run once
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tiered_cache::backends::MemoryStore;
//! use tiered_cache::{Affects, CacheConfig, InvalidationRules, LocalBus, TieredCacheBuilder};
//!
//! #[tokio::main]
//! async fn main() -> tiered_cache::CacheResult<()> {
//!     let rules = InvalidationRules::new().rule(
//!         "user.updated",
//!         [Affects::detail("user", ["userId"]), Affects::lists("users")],
//!     );
//!     let cache = TieredCacheBuilder::<String>::new(CacheConfig::new("user-service"))
//!         .with_rules(rules)
//!         .with_l2(Arc::new(MemoryStore::new()))
//!         .with_bus(Arc::new(LocalBus::default()))
//!         .build()
//!         .await?;
//!
//!     let key = cache.keys().build_key("user", [("userId", "42")]);
//!     cache.set(&key, "alice".to_string()).await?;
//!     assert_eq!(cache.get(&key).await.as_deref(), Some("alice"));
//!
//!     // After the write to the source of truth:
//!     cache.invalidate("user.updated", [("userId", "42")]).await?;
//!     assert_eq!(cache.get(&key).await, None);
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! get:        L1 ──miss──▶ L2 ──miss──▶ caller loads from source, calls set
//!              ▲            │hit
//!              └─back-fill──┘
//!
//! invalidate: rules ─▶ L1 purge ─▶ L2 purge ─▶ bus ─▶ peers' L1 purge
//! ```
//!
//! # Staleness
//!
//! A stale value can be served for at most `min(entry TTL, bus delivery
//! latency)` after the invalidation. With the bus down the bound is the
//! entry's TTL.

pub mod backends;
pub mod builder;
pub mod cache_manager;
pub mod codecs;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod keys;
pub mod l1_cache;
pub mod traits;

pub use builder::TieredCacheBuilder;
pub use cache_manager::{HealthStatus, TieredCache, TieredStats};
pub use codecs::JsonCodec;
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use invalidation::{
    InvalidationConfig, InvalidationEvent, InvalidationStats, LocalBus, LocalInvalidator,
    Subscription,
};
pub use keys::{Affects, CacheKey, InvalidationPlan, InvalidationRules, KeyBuilder, KeyPattern};
pub use l1_cache::{CacheEntry, CacheStats, LocalCache, SweepOutcome};
pub use traits::{CacheCodec, DistributedCache, InvalidationBus, InvalidationHandler};

// Re-export async_trait for implementing the backend traits
pub use async_trait::async_trait;
