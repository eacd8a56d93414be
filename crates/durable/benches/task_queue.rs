//! Task queue benchmark
//!
//! Benchmarks the critical path: enqueue → poll → ack on the in-memory
//! store, single-threaded and with concurrent pollers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use tokio::runtime::Runtime;
use uuid::Uuid;

use waypoint_durable::persistence::{InMemoryWorkflowStore, TaskDefinition, TaskQueue};

const LEASE: Duration = Duration::from_secs(30);

async fn fill(store: &InMemoryWorkflowStore, count: u64) {
    for _ in 0..count {
        store
            .enqueue(TaskDefinition::decision("bench", Uuid::now_v7()))
            .await
            .unwrap();
    }
}

/// Enqueue cost alone
fn bench_enqueue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_queue/enqueue");
    group.throughput(Throughput::Elements(1));
    group.bench_function("decision", |b| {
        let store = Arc::new(InMemoryWorkflowStore::new());
        b.to_async(&rt).iter(|| {
            let store = store.clone();
            async move {
                store
                    .enqueue(TaskDefinition::decision("bench", Uuid::now_v7()))
                    .await
                    .unwrap()
            }
        });
    });
    group.finish();
}

/// Poll and ack from a pre-filled queue (baseline)
fn bench_poll_ack_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_queue/poll_ack");
    group.throughput(Throughput::Elements(1));

    for backlog in [100u64, 1_000] {
        group.bench_with_input(BenchmarkId::new("backlog", backlog), &backlog, |b, &backlog| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let store = InMemoryWorkflowStore::new();
                fill(&store, iters.max(backlog)).await;

                let start = Instant::now();
                for _ in 0..iters {
                    let task = store.poll("bench", LEASE).await.unwrap().unwrap();
                    store.ack(&task).await.unwrap();
                }
                start.elapsed()
            });
        });
    }
    group.finish();
}

/// Concurrent pollers draining one queue
fn bench_poll_ack_concurrent(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("task_queue/concurrent");
    group.throughput(Throughput::Elements(1_000));

    for pollers in [1usize, 4, 8] {
        group.bench_with_input(BenchmarkId::new("pollers", pollers), &pollers, |b, &pollers| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let store = Arc::new(InMemoryWorkflowStore::new());
                    fill(&store, 1_000).await;

                    let start = Instant::now();
                    let loops = (0..pollers).map(|_| {
                        let store = store.clone();
                        tokio::spawn(async move {
                            while let Some(task) = store.poll("bench", LEASE).await.unwrap() {
                                store.ack(&task).await.unwrap();
                            }
                        })
                    });
                    for joined in join_all(loops).await {
                        joined.unwrap();
                    }
                    total += start.elapsed();
                }
                total
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue,
    bench_poll_ack_single,
    bench_poll_ack_concurrent
);
criterion_main!(benches);
