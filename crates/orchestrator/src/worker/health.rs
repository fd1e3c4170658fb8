//! Health monitor
//!
//! Runs once per heartbeat interval:
//! - declares workers lost when their heartbeat is older than
//!   `missed_heartbeats × heartbeat_interval`, or when their tokio task ended
//!   without the worker marking itself dead, and returns their task to the
//!   queue
//! - replaces lost workers while the pool is below `min_workers`
//! - grows or shrinks the pool between `min_workers` and `max_workers`
//! - prunes old terminal task records

use std::sync::Weak;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::pool::{PoolInner, PoolStatus};
use super::record::WorkerStatus;
use crate::metrics;
use crate::task::{TaskError, TaskId};

pub(super) async fn monitor(pool: Weak<PoolInner>) {
    let Some(interval) = pool.upgrade().map(|p| p.config.pool.heartbeat_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            break;
        };
        sweep(&pool).await;
    }
    debug!("Health monitor stopped");
}

pub(super) async fn sweep(pool: &PoolInner) {
    for (worker_id, current_task_id) in collect_lost(pool) {
        warn!(worker_id, task_id = ?current_task_id, "Worker lost");
        pool.metrics
            .increment_counter(metrics::WORKERS_LOST, &[], 1);

        // The lease is authoritative; the record may lag a fresh dequeue
        for task_id in pool.queue.leases_of(&worker_id).await {
            match pool
                .queue
                .reclaim(task_id, &worker_id, TaskError::worker_lost(&worker_id))
                .await
            {
                Some(state) => info!(worker_id, %task_id, %state, "Reclaimed task from lost worker"),
                None => debug!(worker_id, %task_id, "Task of lost worker already settled"),
            }
        }
    }

    if pool.status() == PoolStatus::Running {
        replenish(pool);
        rescale(pool);
    }
    publish_gauges(pool);

    if let Some(retention) = pool.config.pool.record_retention {
        pool.queue.prune_finished(retention).await;
    }
}

/// Remove dead and lost workers; returns lost workers with their task
fn collect_lost(pool: &PoolInner) -> Vec<(String, Option<TaskId>)> {
    let lost_after = pool.config.pool.lost_after();
    let mut lost = Vec::new();

    pool.workers.lock().retain(|worker_id, slot| {
        let mut record = slot.record.lock();
        let finished = slot.handle.is_finished();
        match record.status {
            // Clean exit
            WorkerStatus::Dead => !finished,
            _ if finished || record.silent_for() > lost_after => {
                record.status = WorkerStatus::Dead;
                slot.handle.abort();
                lost.push((worker_id.clone(), record.current_task_id.take()));
                false
            }
            _ => true,
        }
    });
    lost
}

/// Keep at least `min_workers` live workers
fn replenish(pool: &PoolInner) {
    let live = live_workers(pool);
    let min = pool.config.pool.min_workers;
    for _ in live..min {
        let worker_id = pool.spawn_worker();
        info!(worker_id, "Started replacement worker");
    }
}

fn rescale(pool: &PoolInner) {
    let Some(scaling) = &pool.config.pool.scaling else {
        return;
    };
    let depth = pool.queue.depth();
    let now = Instant::now();
    let mut pressure_since = pool.scale_pressure_since.lock();

    if depth > scaling.queue_depth_threshold {
        let since = *pressure_since.get_or_insert(now);
        if now.duration_since(since) >= scaling.sustained_for
            && occupied_workers(pool) < pool.config.pool.max_workers
        {
            let worker_id = pool.spawn_worker();
            info!(worker_id, depth, "Queue backed up, added worker");
            *pressure_since = Some(now);
        }
        return;
    }

    *pressure_since = None;
    if depth > 0 {
        return;
    }

    let min = pool.config.pool.min_workers;
    let workers = pool.workers.lock();
    let mut live = workers
        .values()
        .filter(|slot| !slot.retire.is_cancelled())
        .count();
    for (worker_id, slot) in workers.iter() {
        if live <= min {
            break;
        }
        if slot.retire.is_cancelled() || slot.record.lock().status != WorkerStatus::Idle {
            continue;
        }
        slot.retire.cancel();
        live -= 1;
        debug!(worker_id, "Retiring idle worker");
    }
}

/// Workers neither dead nor retiring
fn live_workers(pool: &PoolInner) -> usize {
    pool.workers
        .lock()
        .values()
        .filter(|slot| !slot.retire.is_cancelled() && slot.record.lock().status != WorkerStatus::Dead)
        .count()
}

/// Workers not yet dead, including retiring ones still finishing a task
fn occupied_workers(pool: &PoolInner) -> usize {
    pool.workers
        .lock()
        .values()
        .filter(|slot| slot.record.lock().status != WorkerStatus::Dead)
        .count()
}

fn publish_gauges(pool: &PoolInner) {
    let (mut busy, mut idle) = (0usize, 0usize);
    for slot in pool.workers.lock().values() {
        match slot.record.lock().status {
            WorkerStatus::Busy => busy += 1,
            WorkerStatus::Idle => idle += 1,
            _ => {}
        }
    }
    pool.metrics
        .set_gauge(metrics::ACTIVE_WORKERS, &[], busy as f64);
    pool.metrics
        .set_gauge(metrics::IDLE_WORKERS, &[], idle as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::executor::{ExecutionContext, ExecutorRegistry};
    use crate::metrics::InMemoryMetrics;
    use crate::task::{Payload, TaskErrorKind, TaskSpec, TaskState};
    use crate::worker::pool::{Orchestrator, PoolConfig, ScalingConfig};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn hanging_executors() -> ExecutorRegistry {
        let mut executors = ExecutorRegistry::new();
        executors.register_fn("hang", |_args: Value, _ctx: ExecutionContext| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        });
        executors
    }

    #[tokio::test]
    async fn test_lost_worker_task_is_reclaimed_and_replaced() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let config = OrchestratorConfig::default().with_pool(
            PoolConfig::fixed(1).with_heartbeat_interval(Duration::from_millis(30)),
        );
        let orchestrator = Orchestrator::builder(config)
            .with_executors(hanging_executors())
            .with_metrics(metrics.clone())
            .build()
            .unwrap();
        orchestrator.start().await.unwrap();

        let handle = orchestrator
            .submit(TaskSpec::new("nmap", Payload::operation("hang")).with_max_attempts(1))
            .await
            .unwrap();
        let mut rx = orchestrator.queue().subscribe(handle.id()).unwrap();
        rx.wait_for(|t| t.state == TaskState::Running).await.unwrap();

        let worker_id = orchestrator.status(handle.id()).unwrap().worker_id.unwrap();
        assert!(orchestrator.abort_worker(&worker_id));

        let task = handle.wait_record(Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.unwrap().kind, TaskErrorKind::WorkerLost);
        assert_eq!(metrics.counter(metrics::WORKERS_LOST, &[]), 1);

        // A replacement keeps the pool at its minimum
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = orchestrator.pool_stats();
        assert_eq!(stats.total_workers, 1);
        assert!(stats.workers.iter().all(|w| w.worker_id != worker_id));

        orchestrator.shutdown(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_grows_under_sustained_depth() {
        let config = OrchestratorConfig::default().with_pool(
            PoolConfig::default()
                .with_workers(1, 3)
                .with_heartbeat_interval(Duration::from_millis(20))
                .with_cancel_grace(Duration::from_millis(20))
                .with_scaling(Some(ScalingConfig {
                    queue_depth_threshold: 2,
                    sustained_for: Duration::from_millis(40),
                })),
        );
        let orchestrator = Orchestrator::new(config, hanging_executors()).unwrap();
        orchestrator.start().await.unwrap();

        for _ in 0..10 {
            orchestrator
                .submit(TaskSpec::new("nmap", Payload::operation("hang")))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        let stats = orchestrator.pool_stats();
        assert_eq!(stats.total_workers, 3);
        assert_eq!(stats.running, 3);

        let report = orchestrator.shutdown(Duration::from_millis(50)).await.unwrap();
        assert_eq!(report.force_cancelled, 3);
        assert_eq!(report.cancelled_pending, 7);
    }

    #[tokio::test]
    async fn test_growth_counts_draining_workers() {
        let config = OrchestratorConfig::default().with_pool(
            PoolConfig::default()
                .with_workers(1, 2)
                .with_heartbeat_interval(Duration::from_millis(20))
                .with_cancel_grace(Duration::from_millis(20))
                .with_scaling(Some(ScalingConfig {
                    queue_depth_threshold: 0,
                    sustained_for: Duration::from_millis(40),
                })),
        );
        let orchestrator = Orchestrator::new(config, hanging_executors()).unwrap();
        orchestrator.start().await.unwrap();
        let hang = || TaskSpec::new("nmap", Payload::operation("hang"));

        let first = orchestrator.submit(hang()).await.unwrap();
        let mut rx = orchestrator.queue().subscribe(first.id()).unwrap();
        rx.wait_for(|t| t.state == TaskState::Running).await.unwrap();
        let draining = orchestrator.status(first.id()).unwrap().worker_id.unwrap();

        // Retire the busy worker in favour of a fresh one; it keeps running its task
        orchestrator.inner().spawn_worker();
        orchestrator.inner().workers.lock()[&draining].retire.cancel();
        orchestrator.submit(hang()).await.unwrap();
        orchestrator.submit(hang()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = orchestrator.pool_stats();
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.running, 2);
        assert_eq!(orchestrator.queue().depth(), 1);

        orchestrator.shutdown(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_workers_retired_down_to_min() {
        let config = OrchestratorConfig::default().with_pool(
            PoolConfig::default()
                .with_workers(1, 4)
                .with_heartbeat_interval(Duration::from_millis(20)),
        );
        let orchestrator = Orchestrator::new(config, ExecutorRegistry::new()).unwrap();
        orchestrator.start().await.unwrap();
        // Simulate an earlier scale-up
        orchestrator.inner().spawn_worker();
        orchestrator.inner().spawn_worker();
        assert_eq!(orchestrator.pool_stats().total_workers, 3);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(orchestrator.pool_stats().total_workers, 1);

        orchestrator.shutdown(Duration::from_millis(50)).await.unwrap();
    }
}
