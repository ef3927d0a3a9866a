//! Tier and Transport Traits
//!
//! The seams of the tiered cache:
//!
//! - `CacheCodec`: pluggable serialization of values crossing the L2 boundary
//! - `DistributedCache`: the shared L2 store
//! - `InvalidationBus`: broadcast channel carrying invalidation events between instances
//! - `InvalidationHandler`: receiving side of the bus
//!
//! # Example: Custom L2 Backend
//!
//! ```rust,ignore
//! use tiered_cache::{async_trait, CacheResult, DistributedCache, KeyPattern};
//! use std::time::Duration;
//!
//! struct MyStore {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl DistributedCache for MyStore {
//!     async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> { todo!() }
//!     async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> { todo!() }
//!     async fn delete(&self, key: &str) -> CacheResult<()> { todo!() }
//!     async fn delete_matching(&self, pattern: &KeyPattern) -> CacheResult<usize> { todo!() }
//!     async fn health_check(&self) -> bool { todo!() }
//! }
//! ```

use crate::error::CacheResult;
use crate::invalidation::{InvalidationEvent, Subscription};
use crate::keys::KeyPattern;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Trait for cache value serialization/deserialization
///
/// Values are held as-is in L1 and serialized only on their way to and from L2.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync + Debug` to support concurrent access across async tasks.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented by this codec.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding of `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Name of the codec, for logging
    fn name(&self) -> &'static str;
}

/// Shared L2 store reachable by every process instance
///
/// Implementations report connectivity problems as
/// [`CacheError::BackendUnavailable`](crate::CacheError::BackendUnavailable).
/// The facade bounds every call with its own timeout and degrades on error,
/// so implementations do not need to retry.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Get the encoded value of a live key
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store an encoded value with a time-to-live
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Get several keys at once, one slot per requested key
    ///
    /// The default issues one `get` per key; stores with a batch read override it.
    async fn get_many(&self, keys: &[&str]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Store several encoded values, each with its own TTL
    async fn set_many(&self, entries: &[(&str, &[u8], Duration)]) -> CacheResult<()> {
        for (key, value, ttl) in entries {
            self.set(key, value, *ttl).await?;
        }
        Ok(())
    }

    /// Remove a key; removing an absent key succeeds
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Remove every key matching `pattern`; returns how many were removed
    async fn delete_matching(&self, pattern: &KeyPattern) -> CacheResult<usize>;

    /// Check if the store is reachable and operational
    async fn health_check(&self) -> bool;

    /// Name of the backend, for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Receiver of invalidation events
///
/// Handlers must be idempotent: at-least-once transports may deliver the
/// same event more than once.
pub trait InvalidationHandler: Send + Sync {
    /// Apply one event
    fn on_event(&self, event: &InvalidationEvent);

    /// The transport may have lost events (lagging receiver, reconnect)
    fn on_gap(&self) {}
}

/// Asynchronous at-least-once broadcast of invalidation events
///
/// Transports must deliver events published for the same key in publish
/// order; otherwise an old invalidation can overtake a newer write.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    /// Hand an event to the transport without waiting for remote delivery
    async fn publish(&self, event: &InvalidationEvent) -> CacheResult<()>;

    /// Start delivering events to `handler` until the subscription is dropped
    async fn subscribe(&self, handler: Arc<dyn InvalidationHandler>) -> CacheResult<Subscription>;

    /// Name of the transport, for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}
