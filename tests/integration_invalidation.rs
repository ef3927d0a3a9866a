//! Integration tests for cross-node invalidation
//!
//! Two cache nodes share one in-memory L2 and one in-process bus

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tiered_cache::{CacheConfig, CacheError, DistributedCache, InvalidationBus, LocalBus};

#[tokio::test]
async fn test_invalidation_purges_peer_l1() {
    let (a, b, _store) = two_nodes(test_config(), LocalBus::default()).await;
    let key = a.keys().build_key("app", [("appId", "42")]);

    a.set(&key, app(42, "old")).await.unwrap();
    assert_eq!(b.get(&key).await, Some(app(42, "old")));
    assert!(b.local().contains(key.as_str()));

    let plan = a.invalidate("app.updated", [("appId", "42")]).await.unwrap();
    assert!(plan.keys.contains(&key));

    assert!(wait_until(|| !b.local().contains(key.as_str())).await);
    assert_eq!(b.get(&key).await, None);
    assert_eq!(a.get(&key).await, None);
    assert_eq!(b.tier_stats().invalidation.received, 1);
}

#[tokio::test]
async fn test_list_pattern_reaches_every_list_key() {
    let (a, b, _store) = two_nodes(test_config(), LocalBus::default()).await;
    let pages: Vec<_> = (1..=3)
        .map(|page| {
            b.keys()
                .build_list_key("apps", [("tenantId", "t1")], [("page", page.to_string())])
        })
        .collect();
    let unrelated = b.keys().build_key("app", [("appId", "7")]);

    for key in &pages {
        b.set(key, app(0, "list")).await.unwrap();
    }
    b.set(&unrelated, app(7, "other")).await.unwrap();

    a.invalidate("app.updated", [("appId", "42")]).await.unwrap();

    assert!(wait_until(|| pages.iter().all(|k| !b.local().contains(k.as_str()))).await);
    assert!(b.local().contains(unrelated.as_str()));
}

#[tokio::test]
async fn test_unknown_mutation_is_an_error() {
    let (a, _b, _store) = two_nodes(test_config(), LocalBus::default()).await;
    let err = a
        .invalidate("app.archived", [("appId", "1")])
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::UnknownMutation(kind) if kind == "app.archived"));
    assert_eq!(a.tier_stats().invalidation.published, 0);
}

#[tokio::test]
async fn test_invalid_pattern_is_rejected() {
    let (a, _b, _store) = two_nodes(test_config(), LocalBus::default()).await;
    let err = a.invalidate_pattern("app-service:*:list").await.unwrap_err();
    assert!(matches!(err, CacheError::InvalidKeyPattern { .. }));
}

#[tokio::test]
async fn test_redelivered_event_is_harmless() {
    let bus = LocalBus::default();
    let (a, b, _store) = two_nodes(test_config(), bus.clone()).await;
    let key = a.keys().build_key("app", [("appId", "1")]);
    let survivor = a.keys().build_key("app", [("appId", "2")]);
    b.set(&key, app(1, "x")).await.unwrap();
    b.set(&survivor, app(2, "y")).await.unwrap();

    a.delete(&key).await;
    // Same event content again, as an at-least-once transport may deliver it.
    let replay = tiered_cache::InvalidationEvent::new(a.origin_id(), &[key.clone()], &[]);
    bus.publish(&replay).await.unwrap();

    assert!(wait_until(|| b.tier_stats().invalidation.received == 2).await);
    assert!(!b.local().contains(key.as_str()));
    assert!(b.local().contains(survivor.as_str()));
    assert_eq!(b.local().len(), 1);
}

#[tokio::test]
async fn test_own_events_are_not_reapplied() {
    let (a, b, _store) = two_nodes(test_config(), LocalBus::default()).await;
    let key = a.keys().build_key("app", [("appId", "1")]);
    a.set(&key, app(1, "x")).await.unwrap();

    a.delete(&key).await;

    assert!(wait_until(|| b.tier_stats().invalidation.received == 1).await);
    assert!(wait_until(|| a.tier_stats().invalidation.ignored_own == 1).await);
    assert_eq!(a.tier_stats().invalidation.received, 0);
}

#[tokio::test(start_paused = true)]
async fn test_staleness_bounded_by_delivery_latency() {
    let latency = Duration::from_secs(2);
    let (a, b, _store) = two_nodes(test_config(), LocalBus::default().with_delivery_delay(latency)).await;
    let key = a.keys().build_key("app", [("appId", "42")]);

    b.set(&key, app(42, "old")).await.unwrap();
    a.invalidate("app.updated", [("appId", "42")]).await.unwrap();

    // Before delivery the peer may still serve the old value from its L1.
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(b.get(&key).await, Some(app(42, "old")));

    // After the delivery latency, and well before the L1 TTL, it is gone.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(b.get(&key).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_staleness_bounded_by_ttl_when_bus_is_down() {
    let store: Arc<dyn DistributedCache> = Arc::new(tiered_cache::backends::MemoryStore::new());
    let a = node(test_config(), Some(store.clone()), Some(Arc::new(FailingBus))).await;
    let b = node(test_config(), Some(store), Some(Arc::new(FailingBus))).await;
    let key = a.keys().build_key("app", [("appId", "42")]);

    b.set(&key, app(42, "old")).await.unwrap();
    a.invalidate("app.updated", [("appId", "42")]).await.unwrap();
    assert_eq!(a.tier_stats().invalidation.publish_failures, 1);
    assert!(b.health_check().await.is_degraded());

    // L1 TTL is 10s: the peer keeps serving its copy until then.
    tokio::time::advance(Duration::from_millis(9_999)).await;
    assert_eq!(b.get(&key).await, Some(app(42, "old")));

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(b.get(&key).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_second_purge_removes_late_backfill() {
    let config = CacheConfig {
        double_delete_delay: Some(Duration::from_millis(500)),
        ..test_config()
    };
    let (a, _b, store) = two_nodes(config, LocalBus::default()).await;
    let key = a.keys().build_key("app", [("appId", "42")]);

    a.invalidate("app.updated", [("appId", "42")]).await.unwrap();
    // A slow reader writes a value it fetched before the mutation.
    store
        .set(key.as_str(), br#"{"id":42,"name":"old"}"#, Duration::from_secs(300))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(store.get(key.as_str()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_second_purge() {
    let config = CacheConfig {
        double_delete_delay: Some(Duration::from_millis(500)),
        ..test_config()
    };
    let (a, _b, store) = two_nodes(config, LocalBus::default()).await;
    let key = a.keys().build_key("app", [("appId", "42")]);

    a.invalidate("app.updated", [("appId", "42")]).await.unwrap();
    a.shutdown().await;
    let published = a.tier_stats().invalidation.published;

    store
        .set(key.as_str(), br#"{"id":42,"name":"new"}"#, Duration::from_secs(300))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(store.get(key.as_str()).await.unwrap().is_some());
    assert_eq!(a.tier_stats().invalidation.published, published);
}

#[tokio::test]
async fn test_lagging_subscriber_clears_its_l1() {
    let (a, b, _store) = two_nodes(test_config(), LocalBus::new(2)).await;
    let kept = b.keys().build_key("app", [("appId", "keep")]);
    b.set(&kept, app(0, "x")).await.unwrap();

    // Current-thread runtime: nothing is delivered until this task yields,
    // so the receiver falls behind the bounded channel.
    for id in 0..10 {
        let key = a.keys().build_key("app", [("appId", id.to_string())]);
        a.delete(&key).await;
    }

    assert!(wait_until(|| b.tier_stats().invalidation.gaps >= 1).await);
    assert!(b.local().is_empty());
}

#[tokio::test]
async fn test_flush_reaches_every_node() {
    let (a, b, store) = two_nodes(test_config(), LocalBus::default()).await;
    for id in 0..5 {
        let key = b.keys().build_key("app", [("appId", id.to_string())]);
        b.set(&key, app(id, "x")).await.unwrap();
    }

    a.flush().await;

    assert!(wait_until(|| b.local().is_empty()).await);
    assert!(store.is_empty());
}
