//! Cache and Batch Performance Benchmarks
//!
//! Measures the hot paths of the acceleration layer:
//! - Bounded TTL map get/set
//! - Multi-level cache reads (L1 hit, L2 promotion)
//! - Batch scheduler flush over an in-memory executor
//!
//! Uses criterion.rs with the tokio async executor.

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dbaccel_core::batch::{AdaptiveBatchScheduler, BatchConfig, BatchExecutor, OperationKind, OperationRequest};
use dbaccel_core::cache::{BoundedTtlMap, CacheConfig, MultiLevelCache};
use dbaccel_core::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

// ============================================================================
// Helpers
// ============================================================================

struct EchoExecutor;

#[async_trait]
impl BatchExecutor for EchoExecutor {
    async fn execute_group(
        &self,
        _kind: OperationKind,
        _target: &str,
        operations: &[OperationRequest],
    ) -> Result<Vec<Value>> {
        Ok(operations.iter().map(|op| op.payload.clone()).collect())
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_ttl_map(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("ttl_map");
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(3));

    let map: BoundedTtlMap<String, String> = BoundedTtlMap::new("bench", 10_000, Duration::from_secs(60));
    rt.block_on(async {
        for i in 0..10_000 {
            map.set(format!("key-{}", i), format!("value-{}", i), None).await;
        }
    });

    group.bench_function("get_hit", |b| {
        b.to_async(&rt).iter(|| async { black_box(map.get(&"key-5000".to_string()).await) })
    });

    group.bench_function("set_overwrite", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(map.set("key-1".to_string(), "updated".to_string(), None).await) })
    });

    group.finish();
}

fn bench_multi_level(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("multi_level_cache");
    group.measurement_time(Duration::from_secs(3));

    let cache: MultiLevelCache<String, Value> = MultiLevelCache::new(CacheConfig::default());
    rt.block_on(async {
        for i in 0..1_000 {
            cache.set(format!("user:{}", i), json!({ "id": i }), None).await;
        }
    });

    group.bench_function("l1_hit", |b| {
        b.to_async(&rt).iter(|| async { black_box(cache.get(&"user:42".to_string()).await) })
    });

    group.bench_function("miss_with_loader", |b| {
        b.to_async(&rt).iter(|| async {
            cache.delete(&"user:missing".to_string()).await;
            black_box(
                cache
                    .get_or_load(&"user:missing".to_string(), || async { Ok(Some(json!(null))) })
                    .await,
            )
        })
    });

    group.finish();
}

fn bench_batch_flush(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("batch_flush");
    group.measurement_time(Duration::from_secs(3));

    for size in [10usize, 100, 500] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let config = BatchConfig::default().with_batch_size(size, size);
                let scheduler = Arc::new(AdaptiveBatchScheduler::new(config, EchoExecutor).unwrap());
                scheduler.start().await.unwrap();
                let mut handles = Vec::with_capacity(size);
                for i in 0..size {
                    handles.push(
                        scheduler
                            .enqueue(OperationRequest::insert("items").with_payload(json!({ "n": i })))
                            .await,
                    );
                }
                black_box(scheduler.stop().await.unwrap());
                for handle in handles {
                    black_box(handle.await.unwrap());
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ttl_map, bench_multi_level, bench_batch_flush);
criterion_main!(benches);
