//! Queue throughput benchmark
//!
//! Measures the scheduling hot path (enqueue → dequeue → complete) on a bare
//! queue, then end-to-end throughput through a worker pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

use hackgpt_orchestrator::{
    CircuitBreakerConfig, CircuitBreakerRegistry, ExecutionContext, ExecutorRegistry,
    Orchestrator, OrchestratorConfig, Payload, PoolConfig, QueueConfig, TaskQueue, TaskSpec,
};

fn spec(i: u64) -> TaskSpec {
    TaskSpec::new("bench", Payload::new("noop", json!({ "i": i }))).with_priority((i % 10) as i32)
}

/// Single consumer: enqueue a batch, then claim and complete every task
fn bench_queue_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("queue/cycle");
    group.throughput(Throughput::Elements(1));

    for capacity in [1_000usize, 100_000] {
        group.bench_with_input(
            BenchmarkId::new("capacity", capacity),
            &capacity,
            |b, &capacity| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let queue = TaskQueue::new(
                        QueueConfig::default().with_capacity(capacity),
                        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
                    );

                    let start = Instant::now();
                    let mut done = 0u64;
                    while done < iters {
                        let batch = (iters - done).min(capacity as u64);
                        for i in 0..batch {
                            queue.enqueue(spec(i)).await.unwrap();
                        }
                        while let Some(claimed) = queue.dequeue("bench-worker").await {
                            queue.complete(claimed.task, Value::Null).await.unwrap();
                        }
                        queue.prune_finished(Duration::ZERO).await;
                        done += batch;
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

/// Pool of N workers draining a burst of no-op tasks
fn bench_pool_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("pool/throughput");
    group.sample_size(10);
    const TASKS: u64 = 1_000;
    group.throughput(Throughput::Elements(TASKS));

    for workers in [1usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt).iter(|| async move {
                    let mut executors = ExecutorRegistry::new();
                    executors.register_fn("noop", |args: Value, _ctx: ExecutionContext| async move {
                        Ok(args)
                    });
                    let config = OrchestratorConfig::default()
                        .with_queue(QueueConfig::default().with_capacity(TASKS as usize))
                        .with_pool(PoolConfig::fixed(workers));
                    let orchestrator = Orchestrator::new(config, executors).unwrap();
                    orchestrator.start().await.unwrap();

                    let mut handles = Vec::with_capacity(TASKS as usize);
                    for i in 0..TASKS {
                        handles.push(orchestrator.submit(spec(i)).await.unwrap());
                    }
                    for handle in handles {
                        handle.wait(Duration::from_secs(60)).await.unwrap();
                    }
                    orchestrator.shutdown(Duration::from_secs(5)).await.unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_queue_cycle, bench_pool_throughput);
criterion_main!(benches);
