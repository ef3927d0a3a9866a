//! L2 stores and invalidation transports
//!
//! - [`MemoryStore`]: in-process shared store (always available)
//! - [`RedisStore`]: Redis L2 (feature `redis`)
//! - [`RedisBus`]: Redis Pub/Sub invalidation bus (feature `redis`)
//!
//! The in-process bus lives in [`crate::invalidation::LocalBus`].
//!
//! ```rust,no_run
//! # #[cfg(feature = "redis")]
//! # async fn example() -> tiered_cache::CacheResult<()> {
//! use tiered_cache::backends::{RedisBus, RedisStore};
//! use tiered_cache::InvalidationConfig;
//!
//! let store = RedisStore::new().await?;
//! let bus = RedisBus::new(InvalidationConfig::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod memory_store;
pub use memory_store::MemoryStore;

#[cfg(feature = "redis")]
pub mod redis_bus;
#[cfg(feature = "redis")]
pub mod redis_store;

#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
