//! Worker pool and orchestrator API
//!
//! The [`Orchestrator`] owns the task queue, the circuit breakers and a
//! bounded set of workers, and is the only surface callers talk to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::health;
use super::poller::PollerConfig;
use super::record::{SharedRecord, WorkerRecord, WorkerStatus};
use super::runner::Worker;
use crate::config::{ConfigError, OrchestratorConfig};
use crate::executor::ExecutorRegistry;
use crate::handle::{TaskHandle, WaitError};
use crate::metrics::{self, MetricsSink, NoopMetrics};
use crate::persistence::{StoreError, TaskStore};
use crate::queue::{QueueError, TaskCounts, TaskQueue};
use crate::reliability::{CircuitBreakerRegistry, CircuitBreakerSnapshot};
use crate::task::{TaskError, TaskErrorKind, TaskId, TaskRecord, TaskSpec};

/// How often shutdown checks whether in-flight tasks have finished
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Elastic sizing thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingConfig {
    /// Queue depth above which the pool grows
    pub queue_depth_threshold: usize,

    /// How long depth must stay above the threshold before a worker is added
    #[serde(with = "crate::duration_millis")]
    pub sustained_for: Duration,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            queue_depth_threshold: 10,
            sustained_for: Duration::from_secs(10),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Workers kept alive at all times
    pub min_workers: usize,

    /// Upper bound on concurrently running tasks
    pub max_workers: usize,

    #[serde(with = "crate::duration_millis")]
    pub heartbeat_interval: Duration,

    /// Heartbeats a worker may miss before it is declared lost
    pub missed_heartbeats: u32,

    pub poller: PollerConfig,

    /// How long a cancelled executor gets to stop before it is aborted
    #[serde(with = "crate::duration_millis")]
    pub cancel_grace: Duration,

    /// Default drain period for [`Orchestrator::shutdown`]
    #[serde(with = "crate::duration_millis")]
    pub shutdown_grace: Duration,

    /// Elastic sizing; `None` keeps the pool at `min_workers`
    pub scaling: Option<ScalingConfig>,

    /// Drop terminal task records older than this
    #[serde(with = "crate::duration_millis::option")]
    pub record_retention: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 4,
            max_workers: 16,
            heartbeat_interval: Duration::from_secs(5),
            missed_heartbeats: 3,
            poller: PollerConfig::default(),
            cancel_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            scaling: Some(ScalingConfig::default()),
            record_retention: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed pool of `size` workers
    pub fn fixed(size: usize) -> Self {
        Self::default().with_workers(size, size).with_scaling(None)
    }

    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_missed_heartbeats(mut self, missed: u32) -> Self {
        self.missed_heartbeats = missed;
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_scaling(mut self, scaling: Option<ScalingConfig>) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn with_record_retention(mut self, retention: Duration) -> Self {
        self.record_retention = Some(retention);
        self
    }

    /// Silence after which a worker is declared lost
    pub fn lost_after(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats
    }
}

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Accepting submissions, no workers yet
    Created,
    Running,
    /// Shutdown in progress
    Draining,
    Stopped,
}

/// Orchestrator errors
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Submission after shutdown started
    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("orchestrator is already started")]
    AlreadyStarted,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error("failed to serialize task arguments: {0}")]
    Serialization(String),
}

/// Snapshot returned by [`Orchestrator::pool_stats`]
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Pending plus retrying tasks
    pub queue_depth: usize,
    pub running: usize,
    /// Workers running a task
    pub active_workers: usize,
    pub idle_workers: usize,
    /// Workers not yet dead
    pub total_workers: usize,
    pub breaker_states: HashMap<String, CircuitBreakerSnapshot>,
    pub tasks: TaskCounts,
    pub workers: Vec<WorkerRecord>,
}

/// What [`Orchestrator::shutdown`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Pending and retrying tasks cancelled before they started
    pub cancelled_pending: usize,
    /// Running tasks that settled within the grace period
    pub finished_during_drain: usize,
    /// Running tasks cancelled after the grace period
    pub force_cancelled: usize,
}

pub(super) struct WorkerSlot {
    pub(super) record: SharedRecord,
    pub(super) handle: JoinHandle<()>,
    pub(super) retire: CancellationToken,
}

pub(super) struct PoolInner {
    pub(super) config: OrchestratorConfig,
    pub(super) queue: Arc<TaskQueue>,
    pub(super) metrics: Arc<dyn MetricsSink>,
    pub(super) workers: Mutex<HashMap<String, WorkerSlot>>,
    pub(super) scale_pressure_since: Mutex<Option<Instant>>,
    executors: Arc<ExecutorRegistry>,
    store: Option<Arc<dyn TaskStore>>,
    next_worker: AtomicU64,
    status: RwLock<PoolStatus>,
    drain: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    pub(super) fn status(&self) -> PoolStatus {
        *self.status.read()
    }

    pub(super) fn spawn_worker(&self) -> String {
        let n = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let worker_id = format!("worker-{n}");
        let record = Arc::new(Mutex::new(WorkerRecord::new(worker_id.clone())));
        let retire = self.drain.child_token();
        let worker = Worker::new(
            record.clone(),
            self.queue.clone(),
            self.executors.clone(),
            &self.config.pool,
            retire.clone(),
        );
        let handle = tokio::spawn(worker.run());
        self.workers.lock().insert(
            worker_id.clone(),
            WorkerSlot {
                record,
                handle,
                retire,
            },
        );
        debug!(worker_id, "Spawned worker");
        worker_id
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.drain.cancel();
        for slot in self.workers.get_mut().values() {
            slot.handle.abort();
        }
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    executors: ExecutorRegistry,
    store: Option<Arc<dyn TaskStore>>,
    metrics: Arc<dyn MetricsSink>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            executors: ExecutorRegistry::new(),
            store: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    /// Persist every task state change, and recover pending work on start
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        self.config.validate()?;

        let breakers = Arc::new(
            CircuitBreakerRegistry::new(self.config.circuit_breaker.clone())
                .with_metrics(self.metrics.clone()),
        );
        let mut queue = TaskQueue::new(self.config.queue.clone(), breakers)
            .with_retry_policy(self.config.retry.clone())
            .with_metrics(self.metrics.clone());
        if let Some(store) = &self.store {
            queue = queue.with_store(store.clone());
        }

        Ok(Orchestrator {
            inner: Arc::new(PoolInner {
                config: self.config,
                queue: Arc::new(queue),
                metrics: self.metrics,
                workers: Mutex::new(HashMap::new()),
                scale_pressure_since: Mutex::new(None),
                executors: Arc::new(self.executors),
                store: self.store,
                next_worker: AtomicU64::new(1),
                status: RwLock::new(PoolStatus::Created),
                drain: CancellationToken::new(),
                monitor: Mutex::new(None),
            }),
        })
    }
}

/// Task orchestrator
///
/// # Example
///
/// ```no_run
/// use hackgpt_orchestrator::{ExecutorRegistry, Orchestrator, OrchestratorConfig, Payload, TaskSpec};
/// use serde_json::{json, Value};
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut executors = ExecutorRegistry::new();
/// executors.register_fn("port_scan", |args: Value, _ctx| async move {
///     Ok(json!({"target": args["target"], "open_ports": [22, 443]}))
/// });
///
/// let orchestrator = Orchestrator::new(OrchestratorConfig::default(), executors)?;
/// orchestrator.start().await?;
///
/// let handle = orchestrator
///     .submit(TaskSpec::new("nmap", Payload::new("port_scan", json!({"target": "10.0.0.1"}))))
///     .await?;
/// let result = handle.wait(Duration::from_secs(60)).await?;
///
/// orchestrator.shutdown(Duration::from_secs(30)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<PoolInner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        executors: ExecutorRegistry,
    ) -> Result<Self, OrchestratorError> {
        OrchestratorBuilder::new(config)
            .with_executors(executors)
            .build()
    }

    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.inner.queue
    }

    pub fn lifecycle(&self) -> PoolStatus {
        self.inner.status()
    }

    #[cfg(test)]
    pub(super) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Recover stored tasks, spawn `min_workers` workers and the health monitor
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        {
            let mut status = self.inner.status.write();
            match *status {
                PoolStatus::Created => *status = PoolStatus::Running,
                PoolStatus::Running => return Err(OrchestratorError::AlreadyStarted),
                PoolStatus::Draining | PoolStatus::Stopped => {
                    return Err(OrchestratorError::ShuttingDown)
                }
            }
        }

        if let Err(e) = self.recover().await {
            *self.inner.status.write() = PoolStatus::Created;
            return Err(e);
        }

        let pool = &self.inner.config.pool;
        for _ in 0..pool.min_workers {
            self.inner.spawn_worker();
        }
        let monitor = tokio::spawn(health::monitor(Arc::downgrade(&self.inner)));
        *self.inner.monitor.lock() = Some(monitor);

        info!(
            min_workers = pool.min_workers,
            max_workers = pool.max_workers,
            queue_capacity = self.inner.config.queue.capacity,
            "Orchestrator started"
        );
        Ok(())
    }

    async fn recover(&self) -> Result<(), OrchestratorError> {
        let Some(store) = &self.inner.store else {
            return Ok(());
        };
        let tasks = store.load_pending().await?;
        let found = tasks.len();
        let restored = self.inner.queue.restore(tasks).await?;
        if found > 0 {
            info!(found, restored, "Recovered tasks from store");
        }
        Ok(())
    }

    /// Stop accepting work and drain the pool
    ///
    /// Pending tasks are cancelled at once. Running tasks get `grace_period`
    /// to finish; whatever is still running is then cancelled, and after the
    /// cancellation grace the workers are torn down.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace_period: Duration) -> Result<ShutdownReport, OrchestratorError> {
        {
            let mut status = self.inner.status.write();
            match *status {
                PoolStatus::Draining | PoolStatus::Stopped => {
                    debug!("Shutdown already in progress");
                    return Ok(ShutdownReport::default());
                }
                _ => *status = PoolStatus::Draining,
            }
        }
        info!(?grace_period, "Initiating graceful shutdown");

        let queue = &self.inner.queue;
        queue.close();
        let cancelled_pending = queue
            .cancel_pending(TaskError::new(
                TaskErrorKind::Shutdown,
                "pool shut down before the task started",
            ))
            .await
            .len();

        // Workers finish their current task, then exit
        self.inner.drain.cancel();
        let in_flight = queue.running_len();
        let drained = wait_for_idle(queue, grace_period).await;

        let mut report = ShutdownReport {
            cancelled_pending,
            finished_during_drain: in_flight,
            force_cancelled: 0,
        };

        if !drained {
            let remaining = queue.cancel_running().await;
            warn!(remaining, "Grace period elapsed, cancelling running tasks");
            report.finished_during_drain = in_flight.saturating_sub(remaining);
            report.force_cancelled = remaining;

            let cancel_grace = self.inner.config.pool.cancel_grace + SHUTDOWN_POLL_INTERVAL;
            if !wait_for_idle(queue, cancel_grace).await {
                let abandoned = queue
                    .abandon_running(TaskError::new(
                        TaskErrorKind::Shutdown,
                        "worker did not stop within the cancellation grace",
                    ))
                    .await;
                warn!(abandoned = abandoned.len(), "Abandoned tasks of unresponsive workers");
            }
        }

        self.teardown().await;
        *self.inner.status.write() = PoolStatus::Stopped;
        info!(
            cancelled_pending = report.cancelled_pending,
            finished_during_drain = report.finished_during_drain,
            force_cancelled = report.force_cancelled,
            "Orchestrator stopped"
        );
        Ok(report)
    }

    async fn teardown(&self) {
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.abort();
        }

        let slots: Vec<(String, WorkerSlot)> = self.inner.workers.lock().drain().collect();
        for (worker_id, slot) in slots {
            slot.handle.abort();
            if let Err(e) = slot.handle.await {
                if e.is_panic() {
                    warn!(worker_id, error = %e, "Worker panicked");
                }
            }
            let mut record = slot.record.lock();
            record.status = WorkerStatus::Dead;
            record.current_task_id = None;
        }

        let metrics = &self.inner.metrics;
        metrics.set_gauge(metrics::ACTIVE_WORKERS, &[], 0.0);
        metrics.set_gauge(metrics::IDLE_WORKERS, &[], 0.0);
    }

    // =========================================================================
    // Submission and queries
    // =========================================================================

    /// Enqueue a task and return a handle to it
    ///
    /// Invalid specs and submissions after shutdown fail here and never
    /// enter the queue.
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskHandle, OrchestratorError> {
        self.submit_with_deadline(spec, None).await
    }

    /// Like [`submit`](Self::submit), bounding how long a blocked submission waits
    pub async fn submit_with_deadline(
        &self,
        spec: TaskSpec,
        deadline: Option<Duration>,
    ) -> Result<TaskHandle, OrchestratorError> {
        if matches!(self.lifecycle(), PoolStatus::Draining | PoolStatus::Stopped) {
            return Err(OrchestratorError::ShuttingDown);
        }
        match self.inner.queue.enqueue_with_deadline(spec, deadline).await {
            Ok(id) => Ok(TaskHandle::new(id, self.inner.queue.clone())),
            Err(QueueError::Closed) => Err(OrchestratorError::ShuttingDown),
            Err(e) => Err(e.into()),
        }
    }

    pub fn status(&self, id: TaskId) -> Option<TaskRecord> {
        self.inner.queue.status(id)
    }

    /// Cancel a task; `false` if it is unknown or already finished
    pub async fn cancel(&self, id: TaskId) -> bool {
        self.inner.queue.cancel(id).await
    }

    /// Wait for a task to finish and return its result
    pub async fn wait(&self, id: TaskId, timeout: Duration) -> Result<Value, WaitError> {
        self.handle(id)
            .ok_or(WaitError::NotFound(id))?
            .wait(timeout)
            .await
    }

    /// Handle for a task submitted earlier
    pub fn handle(&self, id: TaskId) -> Option<TaskHandle> {
        self.inner
            .queue
            .status(id)
            .map(|_| TaskHandle::new(id, self.inner.queue.clone()))
    }

    pub fn pool_stats(&self) -> PoolStats {
        let mut workers: Vec<WorkerRecord> = self
            .inner
            .workers
            .lock()
            .values()
            .map(|slot| slot.record.lock().clone())
            .collect();
        workers.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });

        let count = |status: WorkerStatus| workers.iter().filter(|w| w.status == status).count();
        let queue = &self.inner.queue;
        PoolStats {
            queue_depth: queue.depth(),
            running: queue.running_len(),
            active_workers: count(WorkerStatus::Busy),
            idle_workers: count(WorkerStatus::Idle),
            total_workers: workers
                .iter()
                .filter(|w| w.status != WorkerStatus::Dead)
                .count(),
            breaker_states: queue.breakers().snapshots(),
            tasks: queue.counts(),
            workers,
        }
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Force the breaker for `resource_type` back to `Closed`
    pub fn reset_breaker(&self, resource_type: &str) -> bool {
        self.inner.queue.breakers().reset(resource_type)
    }

    /// Kill a worker's task as a crash would
    ///
    /// The worker stops heartbeating; the next health sweep declares it lost
    /// and returns its task to the queue.
    pub fn abort_worker(&self, worker_id: &str) -> bool {
        match self.inner.workers.lock().get(worker_id) {
            Some(slot) => {
                slot.handle.abort();
                warn!(worker_id, "Worker aborted");
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("status", &self.lifecycle())
            .field("queue", &self.inner.queue)
            .field("workers", &self.inner.workers.lock().len())
            .finish()
    }
}

/// Poll until nothing is running or `limit` elapses; `true` if drained
async fn wait_for_idle(queue: &TaskQueue, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if queue.running_len() == 0 {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(SHUTDOWN_POLL_INTERVAL.min(deadline - now)).await;
    }
}
