//! Cache invalidation and synchronization module
//!
//! Cross-instance invalidation: every [`TieredCache`](crate::TieredCache)
//! publishes the keys and patterns it purged, and every instance applies the
//! events it receives to its own L1.
//!
//! - [`InvalidationEvent`]: the message, JSON-encoded on the wire
//! - [`LocalBus`]: in-process transport (tests, demos, several caches in one process)
//! - [`RedisBus`](crate::backends::RedisBus): Redis Pub/Sub transport (feature `redis`)
//! - [`LocalInvalidator`]: the handler applying events to an L1 cache
//!
//! Delivery is at-least-once and applying an event is idempotent. When a
//! transport reports a possible gap the receiving L1 is cleared, since the
//! lost events can no longer be identified.

use crate::error::{CacheError, CacheResult};
use crate::keys::{CacheKey, KeyPattern};
use crate::l1_cache::LocalCache;
use crate::traits::{InvalidationBus, InvalidationHandler};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Invalidation message broadcast to every cache instance
///
/// Wire shape: `{"keys":[..],"patterns":[..],"originId":"..","emittedAt":<unix ms>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    /// Exact keys to remove
    #[serde(default)]
    pub keys: Vec<String>,
    /// Trailing-`*` patterns to remove
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Instance that published the event
    pub origin_id: String,
    /// Publish time, milliseconds since the Unix epoch
    pub emitted_at: u64,
}

impl InvalidationEvent {
    /// Build an event stamped with the current time
    pub fn new(origin_id: impl Into<String>, keys: &[CacheKey], patterns: &[KeyPattern]) -> Self {
        let emitted_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();

        Self {
            keys: keys.iter().map(|k| k.as_str().to_string()).collect(),
            patterns: patterns.iter().map(|p| p.as_str().to_string()).collect(),
            origin_id: origin_id.into(),
            emitted_at: u64::try_from(emitted_at).unwrap_or(u64::MAX),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.patterns.is_empty()
    }

    /// Serialize to JSON for transmission
    ///
    /// # Errors
    ///
    /// [`CacheError::Codec`] if serialization fails.
    pub fn to_json(&self) -> CacheResult<String> {
        serde_json::to_string(self)
            .map_err(|e| CacheError::Codec(format!("failed to serialize invalidation event: {e}")))
    }

    /// Deserialize from JSON
    ///
    /// # Errors
    ///
    /// [`CacheError::Codec`] if the payload is not an invalidation event.
    pub fn from_json(json: &str) -> CacheResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CacheError::Codec(format!("failed to deserialize invalidation event: {e}")))
    }
}

/// Configuration for the Redis invalidation bus
#[derive(Debug, Clone)]
pub struct InvalidationConfig {
    /// Redis Pub/Sub channel name for invalidation messages
    pub channel: String,
    /// Events buffered between `publish` and the Redis connection
    pub publish_queue_capacity: usize,
    /// Wait between subscriber reconnect attempts
    pub reconnect_delay: Duration,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            channel: "cache:invalidate".to_string(),
            publish_queue_capacity: 1024,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Statistics for invalidation operations
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationStats {
    /// Events handed to the bus
    pub published: u64,
    /// Events the bus refused
    pub publish_failures: u64,
    /// Events received and applied
    pub received: u64,
    /// Events received from this same instance and skipped
    pub ignored_own: u64,
    /// Exact keys applied from received events
    pub keys_applied: u64,
    /// Patterns applied from received events
    pub patterns_applied: u64,
    /// Malformed patterns or payloads
    pub processing_errors: u64,
    /// Possible message loss reported by the transport
    pub gaps: u64,
}

/// Thread-safe statistics for invalidation operations
#[derive(Debug, Default)]
pub struct AtomicInvalidationStats {
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub received: AtomicU64,
    pub ignored_own: AtomicU64,
    pub keys_applied: AtomicU64,
    pub patterns_applied: AtomicU64,
    pub processing_errors: AtomicU64,
    pub gaps: AtomicU64,
}

impl AtomicInvalidationStats {
    pub fn snapshot(&self) -> InvalidationStats {
        InvalidationStats {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            ignored_own: self.ignored_own.load(Ordering::Relaxed),
            keys_applied: self.keys_applied.load(Ordering::Relaxed),
            patterns_applied: self.patterns_applied.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.published,
            &self.publish_failures,
            &self.received,
            &self.ignored_own,
            &self.keys_applied,
            &self.patterns_applied,
            &self.processing_errors,
            &self.gaps,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Handle on a running subscription
///
/// The background task stops on [`Subscription::cancel`] or when the handle is dropped.
pub struct Subscription {
    task: Option<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Subscription {
    /// Wrap a subscriber task listening on `shutdown_tx`
    pub fn new(task: JoinHandle<()>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            task: Some(task),
            shutdown_tx,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signal the subscriber to stop and wait for it
    pub async fn cancel(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// In-process invalidation bus over a Tokio broadcast channel
///
/// Every cache built with a clone of the same `LocalBus` receives every event,
/// in publish order. A receiver that falls more than `capacity` events behind
/// reports a gap.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<InvalidationEvent>,
    delivery_delay: Duration,
}

impl LocalBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            delivery_delay: Duration::ZERO,
        }
    }

    /// Delay every delivery by `delay`, modelling transport latency
    #[must_use]
    pub fn with_delivery_delay(mut self, delay: Duration) -> Self {
        self.delivery_delay = delay;
        self
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl InvalidationBus for LocalBus {
    async fn publish(&self, event: &InvalidationEvent) -> CacheResult<()> {
        // No subscribers is not a failure: there is nobody to notify.
        let delivered = self.sender.send(event.clone()).unwrap_or(0);
        debug!(receivers = delivered, "[Bus] Published invalidation event");
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn InvalidationHandler>) -> CacheResult<Subscription> {
        let mut events = self.sender.subscribe();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let delay = self.delivery_delay;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            handler.on_event(&event);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed = missed, "[Bus] Subscriber lagged behind, events lost");
                            handler.on_gap();
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("[Bus] Local subscriber stopped");
        });

        info!("Subscribed to local invalidation bus");
        Ok(Subscription::new(task, shutdown_tx))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Applies received invalidation events to one L1 cache
pub struct LocalInvalidator<V> {
    cache: Arc<LocalCache<V>>,
    origin_id: String,
    apply_own_events: bool,
    sweep_budget: usize,
    stats: Arc<AtomicInvalidationStats>,
}

impl<V> LocalInvalidator<V> {
    pub fn new(
        cache: Arc<LocalCache<V>>,
        origin_id: impl Into<String>,
        apply_own_events: bool,
        sweep_budget: usize,
        stats: Arc<AtomicInvalidationStats>,
    ) -> Self {
        Self {
            cache,
            origin_id: origin_id.into(),
            apply_own_events,
            sweep_budget,
            stats,
        }
    }
}

impl<V: Clone + Send + 'static> InvalidationHandler for LocalInvalidator<V> {
    fn on_event(&self, event: &InvalidationEvent) {
        if event.origin_id == self.origin_id && !self.apply_own_events {
            self.stats.ignored_own.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        for key in &event.keys {
            self.cache.delete(key);
        }
        self.stats
            .keys_applied
            .fetch_add(event.keys.len() as u64, Ordering::Relaxed);

        for raw in &event.patterns {
            match KeyPattern::parse(raw) {
                Ok(pattern) => {
                    let outcome = self.cache.delete_matching(&pattern, self.sweep_budget);
                    if outcome.exhausted {
                        warn!(
                            pattern = %pattern,
                            examined = outcome.examined,
                            "[L1] Sweep budget exhausted, remaining matches expire by TTL"
                        );
                    }
                    self.stats.patterns_applied.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(error = %e, origin = %event.origin_id, "[Bus] Ignoring malformed pattern");
                    self.stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        debug!(
            origin = %event.origin_id,
            keys = event.keys.len(),
            patterns = event.patterns.len(),
            "[L1] Applied invalidation event"
        );
    }

    fn on_gap(&self) {
        let dropped = self.cache.clear();
        self.stats.gaps.fetch_add(1, Ordering::Relaxed);
        warn!(dropped = dropped, "[L1] Invalidation gap, cleared local cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyBuilder;

    const TTL: Duration = Duration::from_secs(60);

    fn invalidator(cache: &Arc<LocalCache<u32>>) -> (LocalInvalidator<u32>, Arc<AtomicInvalidationStats>) {
        let stats = Arc::new(AtomicInvalidationStats::default());
        let inv = LocalInvalidator::new(Arc::clone(cache), "node-b", false, 100, Arc::clone(&stats));
        (inv, stats)
    }

    #[test]
    fn test_event_json_shape() {
        let keys = KeyBuilder::new("app-service");
        let key = keys.build_key("app", [("appId", "42")]);
        let event = InvalidationEvent::new("node-a", &[key], &[keys.list_pattern("apps")]);

        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["keys"][0], "app-service:app:42");
        assert_eq!(value["patterns"][0], "app-service:apps:list:*");
        assert_eq!(value["originId"], "node-a");
        assert!(value["emittedAt"].as_u64().unwrap() > 0);

        let parsed = InvalidationEvent::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_from_json_defaults_missing_lists() {
        let event = InvalidationEvent::from_json(r#"{"originId":"x","emittedAt":1}"#).unwrap();
        assert!(event.is_empty());
        assert!(InvalidationEvent::from_json("not json").is_err());
    }

    #[test]
    fn test_applying_twice_matches_applying_once() {
        let cache = Arc::new(LocalCache::new(100, 1));
        for key in ["s:app:1", "s:app:2", "s:apps:list:a", "s:apps:list:b"] {
            cache.set(key, 1, TTL).unwrap();
        }
        let (inv, _) = invalidator(&cache);
        let event = InvalidationEvent {
            keys: vec!["s:app:1".into()],
            patterns: vec!["s:apps:list:*".into()],
            origin_id: "node-a".into(),
            emitted_at: 0,
        };

        inv.on_event(&event);
        let after_once = (cache.len(), cache.contains("s:app:2"));
        inv.on_event(&event);

        assert_eq!((cache.len(), cache.contains("s:app:2")), after_once);
        assert_eq!(after_once, (1, true));
    }

    #[test]
    fn test_own_events_are_skipped() {
        let cache = Arc::new(LocalCache::new(10, 1));
        cache.set("k", 1, TTL).unwrap();
        let (inv, stats) = invalidator(&cache);

        inv.on_event(&InvalidationEvent {
            keys: vec!["k".into()],
            patterns: vec![],
            origin_id: "node-b".into(),
            emitted_at: 0,
        });

        assert!(cache.contains("k"));
        assert_eq!(stats.snapshot().ignored_own, 1);
    }

    #[test]
    fn test_malformed_pattern_counts_error() {
        let cache = Arc::new(LocalCache::new(10, 1));
        let (inv, stats) = invalidator(&cache);
        inv.on_event(&InvalidationEvent {
            keys: vec![],
            patterns: vec!["a*b".into()],
            origin_id: "node-a".into(),
            emitted_at: 0,
        });
        assert_eq!(stats.snapshot().processing_errors, 1);
    }

    #[test]
    fn test_gap_clears_cache() {
        let cache = Arc::new(LocalCache::new(10, 1));
        cache.set("k", 1, TTL).unwrap();
        let (inv, stats) = invalidator(&cache);
        inv.on_gap();
        assert!(cache.is_empty());
        assert_eq!(stats.snapshot().gaps, 1);
    }

    #[tokio::test]
    async fn test_local_bus_delivers_in_order() {
        struct Recorder(parking_lot::Mutex<Vec<String>>);
        impl InvalidationHandler for Recorder {
            fn on_event(&self, event: &InvalidationEvent) {
                self.0.lock().extend(event.keys.iter().cloned());
            }
        }

        let bus = LocalBus::new(16);
        let recorder = Arc::new(Recorder(parking_lot::Mutex::new(Vec::new())));
        let sub = bus.subscribe(recorder.clone()).await.unwrap();

        for i in 0..5 {
            let event = InvalidationEvent {
                keys: vec![format!("k{i}")],
                patterns: vec![],
                origin_id: "a".into(),
                emitted_at: 0,
            };
            bus.publish(&event).await.unwrap();
        }

        for _ in 0..50 {
            if recorder.0.lock().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*recorder.0.lock(), vec!["k0", "k1", "k2", "k3", "k4"]);

        sub.cancel().await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = LocalBus::default();
        let event = InvalidationEvent::new("a", &[], &[]);
        assert!(bus.publish(&event).await.is_ok());
    }
}
