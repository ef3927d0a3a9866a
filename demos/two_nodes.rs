//! Two cache nodes in one process sharing an L2 and an invalidation bus
//!
//! ```text
//! RUST_LOG=tiered_cache=debug cargo run --example two_nodes
//! ```

use std::sync::Arc;
use std::time::Duration;
use tiered_cache::backends::MemoryStore;
use tiered_cache::{
    Affects, CacheConfig, InvalidationRules, LocalBus, TieredCache, TieredCacheBuilder,
};
use tracing_subscriber::EnvFilter;

async fn build_node(
    store: Arc<MemoryStore>,
    bus: Arc<LocalBus>,
) -> tiered_cache::CacheResult<TieredCache<serde_json::Value>> {
    let rules = InvalidationRules::new().rule(
        "app.updated",
        [
            Affects::detail("app", ["appId"]),
            Affects::related("app", ["appId"], "latest"),
            Affects::lists("apps"),
        ],
    );
    TieredCacheBuilder::new(CacheConfig::new("app-service"))
        .with_rules(rules)
        .with_l2(store)
        .with_bus(bus)
        .build()
        .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tiered_cache=info")),
        )
        .init();

    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(LocalBus::default().with_delivery_delay(Duration::from_millis(50)));
    let a = build_node(Arc::clone(&store), Arc::clone(&bus)).await?;
    let b = build_node(store, bus).await?;

    let key = a.keys().build_key("app", [("appId", "42")]);
    let list = a
        .keys()
        .build_list_key("apps", [("tenantId", "t1")], [("page", "1")]);

    a.set(&key, serde_json::json!({"id": 42, "name": "notes"})).await?;
    a.set(&list, serde_json::json!([42])).await?;
    tracing::info!(value = ?b.get(&key).await, "node b read through the shared L2");
    tracing::info!(value = ?b.get(&list).await, "node b read the list");

    let plan = a.invalidate("app.updated", [("appId", "42")]).await?;
    tracing::info!(
        keys = plan.keys.len(),
        patterns = plan.patterns.len(),
        "node a invalidated app 42"
    );
    tracing::info!(value = ?b.get(&key).await, "node b before delivery");

    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!(value = ?b.get(&key).await, "node b after delivery");
    tracing::info!(value = ?b.get(&list).await, "node b list after delivery");

    let stats = serde_json::to_string_pretty(&b.tier_stats())?;
    tracing::info!("node b stats:\n{stats}");

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}
