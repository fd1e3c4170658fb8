//! Pool lifecycle: graceful drain, lost workers, restart recovery from a
//! task store, and metrics emitted along the way.
//!
//! Run with: cargo test -p hackgpt-orchestrator --test lifecycle_test

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use hackgpt_orchestrator::metrics;
use hackgpt_orchestrator::{
    CircuitBreakerConfig, CircuitState, ExecutionContext, ExecutorError, ExecutorRegistry,
    InMemoryMetrics, InMemoryTaskStore, Orchestrator, OrchestratorConfig, OrchestratorError,
    Payload, PoolConfig, PoolStatus, RetryPolicy, TaskErrorKind, TaskId, TaskSpec, TaskState,
    TaskStore, WorkerStatus,
};

const WAIT: Duration = Duration::from_secs(10);

fn spec(operation: &str) -> TaskSpec {
    TaskSpec::new("nmap", Payload::operation(operation))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Store writes trail the in-memory record, so poll until one lands
async fn wait_for_stored(store: &InMemoryTaskStore, id: TaskId, state: TaskState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stored = store.get(id).await.unwrap().map(|t| t.state);
        if stored == Some(state) {
            return;
        }
        assert!(Instant::now() < deadline, "store still holds {stored:?} for {id}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn sleeping_executors(duration: Duration) -> ExecutorRegistry {
    let mut executors = ExecutorRegistry::new();
    executors.register_fn("scan", move |args: Value, _ctx: ExecutionContext| async move {
        tokio::time::sleep(duration).await;
        Ok(args)
    });
    executors
}

#[test_log::test(tokio::test)]
async fn test_shutdown_drains_running_and_cancels_pending() {
    let config = OrchestratorConfig::default().with_pool(PoolConfig::fixed(3));
    let orchestrator =
        Orchestrator::new(config, sleeping_executors(Duration::from_millis(200))).unwrap();
    orchestrator.start().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        let spec = TaskSpec::new("nmap", Payload::new("scan", json!(i)));
        handles.push(orchestrator.submit(spec).await.unwrap());
    }
    wait_until(|| orchestrator.pool_stats().running == 3).await;

    let report = orchestrator.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(report.cancelled_pending, 2);
    assert_eq!(report.finished_during_drain, 3);
    assert_eq!(report.force_cancelled, 0);
    assert_eq!(orchestrator.lifecycle(), PoolStatus::Stopped);

    let states: Vec<TaskState> = handles
        .iter()
        .map(|h| h.status().unwrap().state)
        .collect();
    assert_eq!(
        states.iter().filter(|s| **s == TaskState::Succeeded).count(),
        3
    );
    for handle in &handles {
        let task = handle.status().unwrap();
        if task.state == TaskState::Cancelled {
            assert_eq!(task.error.unwrap().kind, TaskErrorKind::Shutdown);
            assert_eq!(task.attempt_count, 0);
        }
    }

    let stats = orchestrator.pool_stats();
    assert_eq!(stats.total_workers, 0);
    assert!(matches!(
        orchestrator.submit(spec("scan")).await,
        Err(OrchestratorError::ShuttingDown)
    ));

    // Idempotent
    let again = orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(again, Default::default());
}

#[test_log::test(tokio::test)]
async fn test_shutdown_force_cancels_after_grace() {
    let mut executors = ExecutorRegistry::new();
    executors.register_fn("scan", |_args: Value, ctx: ExecutionContext| async move {
        ctx.cancelled().await;
        Ok(json!("partial"))
    });
    let config = OrchestratorConfig::default()
        .with_pool(PoolConfig::fixed(2).with_cancel_grace(Duration::from_millis(100)));
    let orchestrator = Orchestrator::new(config, executors).unwrap();
    orchestrator.start().await.unwrap();

    let first = orchestrator.submit(spec("scan")).await.unwrap();
    let second = orchestrator.submit(spec("scan")).await.unwrap();
    wait_until(|| orchestrator.pool_stats().running == 2).await;

    let report = orchestrator
        .shutdown(Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(report.finished_during_drain, 0);
    assert_eq!(report.force_cancelled, 2);

    for handle in [first, second] {
        let task = handle.status().unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
    }
}

#[test_log::test(tokio::test)]
async fn test_task_of_lost_worker_is_retried_elsewhere() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut executors = ExecutorRegistry::new();
    executors.register_fn("scan", |_args: Value, ctx: ExecutionContext| async move {
        if ctx.attempt == 1 {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(json!({ "attempt": ctx.attempt }))
    });

    let config = OrchestratorConfig::default()
        .with_pool(PoolConfig::fixed(1).with_heartbeat_interval(Duration::from_millis(30)))
        .with_retry(RetryPolicy::immediate());
    let orchestrator = Orchestrator::builder(config)
        .with_executors(executors)
        .with_metrics(metrics.clone())
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();

    let handle = orchestrator
        .submit(spec("scan").with_max_attempts(2))
        .await
        .unwrap();
    wait_until(|| handle.status().map(|t| t.state) == Some(TaskState::Running)).await;
    let lost = handle.status().unwrap().worker_id.unwrap();
    assert!(orchestrator.abort_worker(&lost));

    assert_eq!(handle.wait(WAIT).await.unwrap(), json!({ "attempt": 2 }));
    let task = handle.status().unwrap();
    assert_eq!(task.attempt_count, 2);
    assert_ne!(task.worker_id.as_deref(), Some(lost.as_str()));
    assert_eq!(metrics.counter(metrics::WORKERS_LOST, &[]), 1);

    let stats = orchestrator.pool_stats();
    assert_eq!(stats.total_workers, 1);
    assert!(stats
        .workers
        .iter()
        .all(|w| w.worker_id != lost && w.status != WorkerStatus::Dead));

    orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_lost_worker_gives_back_half_open_trial() {
    let mut executors = ExecutorRegistry::new();
    executors.register_fn("fail", |_args: Value, _ctx: ExecutionContext| async move {
        Err::<Value, _>(ExecutorError::permanent("connection refused"))
    });
    executors.register_fn("hang", |_args: Value, _ctx: ExecutionContext| async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    });
    executors.register_fn("scan", |args: Value, _ctx: ExecutionContext| async move { Ok(args) });

    let config = OrchestratorConfig::default()
        .with_pool(PoolConfig::fixed(1).with_heartbeat_interval(Duration::from_millis(30)))
        .with_retry(RetryPolicy::immediate())
        .with_circuit_breaker(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_cooldown(Duration::from_millis(100)),
        );
    let orchestrator = Orchestrator::new(config, executors).unwrap();
    orchestrator.start().await.unwrap();
    let breakers = orchestrator.queue().breakers().clone();

    let failed = orchestrator
        .submit(spec("fail").with_max_attempts(1))
        .await
        .unwrap();
    assert_eq!(
        failed.wait_record(WAIT).await.unwrap().state,
        TaskState::Failed
    );
    assert_eq!(breakers.state("nmap"), CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(150)).await;

    // The hanging attempt holds the only half-open trial when its worker dies
    let hung = orchestrator
        .submit(spec("hang").with_max_attempts(1))
        .await
        .unwrap();
    wait_until(|| hung.status().map(|t| t.state) == Some(TaskState::Running)).await;
    wait_until(|| breakers.state("nmap") == CircuitState::HalfOpen).await;
    let lost = hung.status().unwrap().worker_id.unwrap();
    assert!(orchestrator.abort_worker(&lost));

    let task = hung.wait_record(WAIT).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error.unwrap().kind, TaskErrorKind::WorkerLost);

    let healthy = orchestrator
        .submit(TaskSpec::new("nmap", Payload::new("scan", json!([443]))))
        .await
        .unwrap();
    assert_eq!(healthy.wait(WAIT).await.unwrap(), json!([443]));
    assert_eq!(breakers.state("nmap"), CircuitState::Closed);

    orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_workers_heartbeat_while_idle() {
    let config = OrchestratorConfig::default()
        .with_pool(PoolConfig::fixed(2).with_heartbeat_interval(Duration::from_millis(20)));
    let orchestrator = Orchestrator::new(config, ExecutorRegistry::new()).unwrap();
    orchestrator.start().await.unwrap();

    let before = orchestrator.pool_stats().workers;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let after = orchestrator.pool_stats().workers;

    assert_eq!(before.len(), 2);
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.worker_id, new.worker_id);
        assert_eq!(new.status, WorkerStatus::Idle);
        assert!(new.last_heartbeat > old.last_heartbeat);
    }

    orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_restart_recovers_tasks_from_store() {
    let store = Arc::new(InMemoryTaskStore::new());

    // First process: one task mid-flight, one still queued, then a crash
    let (running_id, pending_id) = {
        let mut executors = ExecutorRegistry::new();
        executors.register_fn("scan", |_args: Value, _ctx: ExecutionContext| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        });
        let orchestrator = Orchestrator::builder(
            OrchestratorConfig::default().with_pool(PoolConfig::fixed(1)),
        )
        .with_executors(executors)
        .with_store(store.clone())
        .build()
        .unwrap();
        orchestrator.start().await.unwrap();

        let running = orchestrator.submit(spec("scan")).await.unwrap();
        wait_until(|| running.status().map(|t| t.state) == Some(TaskState::Running)).await;
        let pending = orchestrator
            .submit(spec("scan").with_priority(5))
            .await
            .unwrap();
        (running.id(), pending.id())
    };
    wait_for_stored(&store, running_id, TaskState::Running).await;
    wait_for_stored(&store, pending_id, TaskState::Pending).await;
    assert_eq!(store.load_pending().await.unwrap().len(), 2);

    // Second process picks both up
    let orchestrator = Orchestrator::builder(
        OrchestratorConfig::default().with_pool(PoolConfig::fixed(2)),
    )
    .with_executors(sleeping_executors(Duration::ZERO))
    .with_store(store.clone())
    .build()
    .unwrap();
    orchestrator.start().await.unwrap();

    let recovered = orchestrator.handle(running_id).unwrap();
    let task = recovered.wait_record(WAIT).await.unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempt_count, 2);

    let task = orchestrator
        .handle(pending_id)
        .unwrap()
        .wait_record(WAIT)
        .await
        .unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempt_count, 1);
    assert_eq!(task.priority, 5);

    wait_for_stored(&store, running_id, TaskState::Succeeded).await;
    wait_for_stored(&store, pending_id, TaskState::Succeeded).await;
    assert!(store.load_pending().await.unwrap().is_empty());

    orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_task_metrics_are_recorded() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let config = OrchestratorConfig::default().with_pool(PoolConfig::fixed(1));
    let orchestrator = Orchestrator::builder(config)
        .with_executors(sleeping_executors(Duration::ZERO))
        .with_metrics(metrics.clone())
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();

    for _ in 0..3 {
        orchestrator
            .submit(spec("scan"))
            .await
            .unwrap()
            .wait(WAIT)
            .await
            .unwrap();
    }

    assert_eq!(metrics.counter(metrics::TASKS_SUBMITTED, &[]), 3);
    assert_eq!(
        metrics.counter(metrics::TASKS_SUCCEEDED, &[("resource_type", "nmap")]),
        3
    );
    assert_eq!(metrics.histogram(metrics::TASK_LATENCY, &[]).len(), 3);

    orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();
}
