//! Benchmarks for the L1 tier and the facade read path
//!
//! This benchmark suite measures:
//! - L1 hit and insert-with-eviction latency
//! - Pattern sweeps of different sizes
//! - Key construction
//! - Facade reads served by L1 and by an in-memory L2

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;
use tiered_cache::backends::MemoryStore;
use tiered_cache::{CacheConfig, KeyBuilder, KeyPattern, LocalCache, TieredCacheBuilder};
use tokio::runtime::Runtime;

const TTL: Duration = Duration::from_secs(300);

fn runtime() -> Runtime {
    Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"))
}

fn bench_l1_get_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("l1_get_hit");

    for shards in [1, 16] {
        let cache = LocalCache::new(10_000, shards);
        for i in 0..10_000 {
            let _ = cache.set(&format!("app:user:{i}"), i, TTL);
        }
        group.bench_with_input(BenchmarkId::from_parameter(shards), &cache, |b, cache| {
            let mut i = 0u32;
            b.iter(|| {
                i = (i + 1) % 10_000;
                black_box(cache.get(&format!("app:user:{i}")))
            });
        });
    }
    group.finish();
}

fn bench_l1_set_with_eviction(c: &mut Criterion) {
    let cache = LocalCache::new(1_000, 1);
    let mut i = 0u64;

    c.bench_function("l1_set_with_eviction", |b| {
        b.iter(|| {
            i += 1;
            let _ = cache.set(&format!("app:user:{i}"), i, TTL);
        });
    });
}

fn bench_delete_matching(c: &mut Criterion) {
    let pattern = KeyPattern::parse("app:apps:list:*").unwrap_or_else(|e| panic!("{e}"));
    let mut group = c.benchmark_group("l1_delete_matching");

    for size in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let cache = LocalCache::new(size, 1);
                    for i in 0..size {
                        let prefix = if i % 2 == 0 { "list" } else { "item" };
                        let _ = cache.set(&format!("app:apps:{prefix}:{i}"), i, TTL);
                    }
                    cache
                },
                |cache| black_box(cache.delete_matching(&pattern, size)),
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_key_building(c: &mut Criterion) {
    let keys = KeyBuilder::new("app-service");
    c.bench_function("build_list_key", |b| {
        b.iter(|| {
            black_box(keys.build_list_key(
                "apps",
                [("tenantId", "t1")],
                [("status", "live"), ("page", "3"), ("pageSize", "50"), ("q", "note app")],
            ))
        });
    });
}

fn bench_tiered_get(c: &mut Criterion) {
    let rt = runtime();
    let config = CacheConfig {
        l1_max_entries: 100,
        sweep_interval: None,
        ..CacheConfig::new("bench")
    };
    let cache = rt.block_on(async {
        TieredCacheBuilder::<String>::new(config)
            .with_l2(Arc::new(MemoryStore::new()))
            .build()
            .await
            .unwrap_or_else(|e| panic!("Failed to build cache: {e}"))
    });
    let key = cache.keys().build_key("user", [("userId", "1")]);
    rt.block_on(cache.set(&key, "alice".repeat(20)))
        .unwrap_or_else(|e| panic!("{e}"));

    let mut group = c.benchmark_group("tiered_get");
    group.bench_function("l1_hit", |b| {
        b.to_async(&rt).iter(|| async { black_box(cache.get(&key).await) });
    });
    group.bench_function("l2_hit_backfill", |b| {
        b.to_async(&rt).iter(|| async {
            cache.clear();
            black_box(cache.get(&key).await)
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_l1_get_hit,
    bench_l1_set_with_eviction,
    bench_delete_matching,
    bench_key_building,
    bench_tiered_get
);
criterion_main!(benches);
