//! Cache configuration
//!
//! [`CacheConfig`] can be built in code, deserialized (durations are encoded
//! as milliseconds), or overlaid from `CACHE_*` environment variables.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Configuration for a [`TieredCache`](crate::TieredCache)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// First segment of every key built by the cache's key builder
    pub namespace: String,
    /// Maximum number of L1 entries
    pub l1_max_entries: usize,
    /// TTL of L1 entries, also used for back-fills from L2
    #[serde(with = "duration_ms", rename = "l1TTL")]
    pub l1_ttl: Duration,
    /// TTL of L2 entries, normally longer than `l1_ttl`
    #[serde(with = "duration_ms", rename = "l2TTL")]
    pub l2_ttl: Duration,
    /// Maximum number of L1 entries examined by one pattern invalidation
    pub sweep_budget_per_invalidation: usize,
    /// Number of independent LRU shards in L1
    pub l1_shards: usize,
    /// Upper bound on every L2 round trip
    #[serde(with = "duration_ms")]
    pub l2_timeout: Duration,
    /// Period of the background expired-entry sweep, `None` for lazy expiry only
    #[serde(with = "option_duration_ms")]
    pub sweep_interval: Option<Duration>,
    /// Upper bound of the random extra TTL added to L2 writes
    #[serde(with = "duration_ms")]
    pub ttl_jitter: Duration,
    /// Delay of the second purge after an invalidation, `None` to purge once
    #[serde(with = "option_duration_ms")]
    pub double_delete_delay: Option<Duration>,
    /// Apply invalidation events published by this same instance
    pub apply_own_events: bool,
    /// TTL of the absent marker cached when a loader finds nothing, in both tiers
    #[serde(with = "duration_ms", rename = "nullValueTTL")]
    pub null_value_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "app".to_string(),
            l1_max_entries: 10_000,
            l1_ttl: Duration::from_secs(10),
            l2_ttl: Duration::from_secs(300),
            sweep_budget_per_invalidation: 10_000,
            l1_shards: 1,
            l2_timeout: Duration::from_millis(250),
            sweep_interval: Some(Duration::from_secs(60)),
            ttl_jitter: Duration::ZERO,
            double_delete_delay: None,
            apply_own_events: false,
            null_value_ttl: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create a configuration with the given key namespace and default values
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `CACHE_*` environment variables
    ///
    /// Recognized: `CACHE_NAMESPACE`, `CACHE_L1_MAX_ENTRIES`, `CACHE_L1_TTL_MS`,
    /// `CACHE_L2_TTL_MS`, `CACHE_SWEEP_BUDGET`, `CACHE_L1_SHARDS`,
    /// `CACHE_L2_TIMEOUT_MS`, `CACHE_NULL_VALUE_TTL_MS`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfig`] if a variable is present but not a number.
    pub fn from_env() -> CacheResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CacheResult<Self> {
        let mut config = Self::default();

        if let Some(namespace) = lookup("CACHE_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(v) = parse_var(&lookup, "CACHE_L1_MAX_ENTRIES")? {
            config.l1_max_entries = v;
        }
        if let Some(ms) = parse_var(&lookup, "CACHE_L1_TTL_MS")? {
            config.l1_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "CACHE_L2_TTL_MS")? {
            config.l2_ttl = Duration::from_millis(ms);
        }
        if let Some(v) = parse_var(&lookup, "CACHE_SWEEP_BUDGET")? {
            config.sweep_budget_per_invalidation = v;
        }
        if let Some(v) = parse_var(&lookup, "CACHE_L1_SHARDS")? {
            config.l1_shards = v;
        }
        if let Some(ms) = parse_var(&lookup, "CACHE_L2_TIMEOUT_MS")? {
            config.l2_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "CACHE_NULL_VALUE_TTL_MS")? {
            config.null_value_ttl = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Check TTLs and sizing
    ///
    /// `l1_max_entries == 0` is not reported here: it is a programmer error and
    /// panics when the L1 cache is created.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidTtl`] for a zero TTL, [`CacheError::InvalidConfig`]
    /// for a zero shard count, sweep budget, L2 timeout or sweep interval.
    pub fn validate(&self) -> CacheResult<()> {
        for ttl in [self.l1_ttl, self.l2_ttl, self.null_value_ttl] {
            if ttl.is_zero() {
                return Err(CacheError::InvalidTtl { ttl });
            }
        }
        if self.l1_shards == 0 {
            return Err(CacheError::InvalidConfig("l1_shards must be at least 1".into()));
        }
        if self.sweep_budget_per_invalidation == 0 {
            return Err(CacheError::InvalidConfig(
                "sweep_budget_per_invalidation must be at least 1".into(),
            ));
        }
        if self.l2_timeout.is_zero() {
            return Err(CacheError::InvalidConfig("l2_timeout must be positive".into()));
        }
        if self.sweep_interval.is_some_and(|every| every.is_zero()) {
            return Err(CacheError::InvalidConfig(
                "sweep_interval must be positive, use None to disable the sweeper".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> CacheResult<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CacheError::InvalidConfig(format!("{name}={raw} is not a valid number"))),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.l1_max_entries, 10_000);
        assert_eq!(config.l1_ttl, Duration::from_secs(10));
        assert!(config.l2_ttl > config.l1_ttl);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CACHE_NAMESPACE", "app-service"),
            ("CACHE_L1_MAX_ENTRIES", "500"),
            ("CACHE_L1_TTL_MS", "2000"),
            ("CACHE_L1_SHARDS", "4"),
        ]
        .into_iter()
        .collect();

        let config =
            CacheConfig::from_lookup(|name| vars.get(name).map(ToString::to_string)).unwrap();
        assert_eq!(config.namespace, "app-service");
        assert_eq!(config.l1_max_entries, 500);
        assert_eq!(config.l1_ttl, Duration::from_secs(2));
        assert_eq!(config.l1_shards, 4);
        assert_eq!(config.l2_ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = CacheConfig::from_lookup(|name| {
            (name == "CACHE_L2_TTL_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let config = CacheConfig {
            l2_ttl: Duration::ZERO,
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::InvalidTtl { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_sweep_interval() {
        let config = CacheConfig {
            sweep_interval: Some(Duration::ZERO),
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));

        let from_json: CacheConfig =
            serde_json::from_value(serde_json::json!({ "sweepInterval": 0 })).unwrap();
        assert!(matches!(from_json.validate(), Err(CacheError::InvalidConfig(_))));

        let disabled = CacheConfig {
            sweep_interval: None,
            ..CacheConfig::default()
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::json!({
            "namespace": "app-service",
            "l1MaxEntries": 100,
            "l1TTL": 1500,
            "l2TTL": 60000,
            "sweepBudgetPerInvalidation": 50,
            "sweepInterval": null,
            "nullValueTTL": 5000
        });
        let config: CacheConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.l1_max_entries, 100);
        assert_eq!(config.l1_ttl, Duration::from_millis(1500));
        assert_eq!(config.l2_ttl, Duration::from_secs(60));
        assert_eq!(config.sweep_budget_per_invalidation, 50);
        assert_eq!(config.sweep_interval, None);
        assert_eq!(config.l1_shards, 1);
        assert_eq!(config.null_value_ttl, Duration::from_secs(5));
    }
}
