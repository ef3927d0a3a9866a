//! Cache error taxonomy
//!
//! A missing key is never an error. Backend failures are reported as
//! [`CacheError::BackendUnavailable`] and are recovered by the facade.

use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the tiered cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// A zero TTL was passed to `set`
    #[error("invalid TTL {ttl:?}: entries must have a positive time-to-live")]
    InvalidTtl { ttl: Duration },

    /// The L2 store or the invalidation bus could not be reached
    #[error("{backend} unavailable: {reason}")]
    BackendUnavailable { backend: &'static str, reason: String },

    /// A glob pattern failed validation
    #[error("invalid key pattern '{pattern}': {reason}")]
    InvalidKeyPattern { pattern: String, reason: &'static str },

    /// No invalidation rule is registered for this mutation kind
    #[error("no invalidation rule registered for mutation '{0}'")]
    UnknownMutation(String),

    /// Value could not be encoded for or decoded from the L2 wire format
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration could not be parsed or is inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    /// Shorthand for [`CacheError::BackendUnavailable`]
    pub fn backend(backend: &'static str, reason: impl Display) -> Self {
        Self::BackendUnavailable {
            backend,
            reason: reason.to_string(),
        }
    }

    /// Whether the error comes from an unreachable tier rather than a caller mistake
    #[must_use]
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

/// Result alias used across the crate
pub type CacheResult<T> = Result<T, CacheError>;
