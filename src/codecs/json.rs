//! JSON codec using `serde_json`

use crate::traits::CacheCodec;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// JSON codec, the default for [`TieredCache`](crate::TieredCache)
///
/// Values written by one process are readable by every other process sharing
/// the L2, whatever language it is written in.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl CacheCodec for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).context("JSON encode failed")
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).context("JSON decode failed")
    }

    fn name(&self) -> &'static str {
        "serde_json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct App {
        id: u32,
        name: String,
    }

    #[test]
    fn test_encodes_plain_json() {
        let bytes = JsonCodec
            .serialize(&App { id: 7, name: "notes".into() })
            .unwrap();
        assert_eq!(bytes, br#"{"id":7,"name":"notes"}"#);
    }

    #[test]
    fn test_decode_error_carries_context() {
        let err = JsonCodec.deserialize::<App>(b"{\"id\":").unwrap_err();
        assert!(err.to_string().contains("JSON decode failed"));
    }
}
