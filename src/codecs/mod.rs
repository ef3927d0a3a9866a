//! Value codecs
//!
//! Implementations of [`CacheCodec`](crate::traits::CacheCodec) used to encode
//! values on their way into L2.

mod json;
pub use json::JsonCodec;
