//! Priority task queue
//!
//! ```text
//!  enqueue ──► ready heap ─────────────► dequeue ──► running leases
//!              (priority desc,                            │
//!               sequence asc)                             │ complete / fail
//!                  ▲                                      ▼
//!                  └── delayed heap (eligible_at) ◄── requeue
//! ```
//!
//! Every mutation happens under one async mutex so the priority/FIFO order
//! holds across concurrent workers. Status reads go through per-task
//! `watch` channels and never take the lock.
//!
//! Operations finish their in-memory changes before the first `.await` that
//! follows them, so a caller cancelled mid-operation never leaves a task
//! published but unreachable. Store writes are handed to a `StoreWriter`
//! and complete regardless of the caller.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify, Semaphore, SemaphorePermit, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::config::{BackpressurePolicy, CircuitOpenPolicy, QueueConfig};
use crate::metrics::{self, MetricsSink, NoopMetrics};
use crate::persistence::{PendingWrite, StoreWriter, TaskStore};
use crate::reliability::{CircuitBreakerRegistry, RetryPolicy};
use crate::task::{
    InvalidTransition, Task, TaskError, TaskErrorKind, TaskId, TaskSpec, TaskSpecError, TaskState,
};

/// Errors returned by queue operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Spec failed validation; the task never entered the queue
    #[error("invalid task spec: {0}")]
    InvalidTaskSpec(#[from] TaskSpecError),

    /// Queue at capacity under the reject policy
    #[error("queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// No space freed up before the enqueue deadline
    #[error("timed out after {0:?} waiting for queue space")]
    EnqueueTimeout(Duration),

    /// Queue no longer accepts tasks
    #[error("queue is closed")]
    Closed,

    /// The caller no longer owns the running task
    #[error("task {0} is not leased to this attempt")]
    StaleLease(TaskId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// A task handed to a worker by [`TaskQueue::dequeue`]
#[derive(Debug)]
pub struct ClaimedTask {
    pub task: Task,

    /// Cancelled when a caller or shutdown asks the attempt to stop
    pub cancel: CancellationToken,
}

/// Number of known tasks in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retrying: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Running => self.running += 1,
            TaskState::Succeeded => self.succeeded += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Retrying => self.retrying += 1,
            TaskState::Cancelled => self.cancelled += 1,
        }
    }

    pub fn get(&self, state: TaskState) -> usize {
        match state {
            TaskState::Pending => self.pending,
            TaskState::Running => self.running,
            TaskState::Succeeded => self.succeeded,
            TaskState::Failed => self.failed,
            TaskState::Retrying => self.retrying,
            TaskState::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> usize {
        TaskState::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    sequence: u64,
    id: TaskId,
}

impl ReadyEntry {
    fn of(task: &Task) -> Self {
        Self {
            priority: task.priority,
            sequence: task.sequence,
            id: task.id,
        }
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (older) first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Queued {
    task: Task,
    /// Whether this entry consumed a capacity slot
    holds_slot: bool,
}

struct Lease {
    worker_id: String,
    attempt: u32,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<Reverse<(Instant, u64, TaskId)>>,
    queued: HashMap<TaskId, Queued>,
    running: HashMap<TaskId, Lease>,
}

impl QueueState {
    /// Move retries whose delay has elapsed onto the ready heap
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((at, _, id))) = self.delayed.peek().copied() {
            if at > now {
                break;
            }
            self.delayed.pop();
            if let Some(queued) = self.queued.get(&id) {
                self.ready.push(ReadyEntry::of(&queued.task));
            }
        }
    }

    fn take_lease(&mut self, task: &Task) -> Result<Lease, QueueError> {
        let owned = self.running.get(&task.id).is_some_and(|lease| {
            lease.attempt == task.attempt_count
                && task.worker_id.as_deref() == Some(lease.worker_id.as_str())
        });
        if !owned {
            return Err(QueueError::StaleLease(task.id));
        }
        self.running
            .remove(&task.id)
            .ok_or(QueueError::StaleLease(task.id))
    }
}

/// How an attempt ended
enum Settle {
    Succeed(serde_json::Value),
    Fail(TaskError),
    Retry(TaskError, Option<Duration>),
    RetryOrFail(TaskError, Option<Duration>),
    Cancel(TaskError),
}

/// Priority queue owning every pending and retrying task
pub struct TaskQueue {
    config: QueueConfig,
    retry: RetryPolicy,
    state: Mutex<QueueState>,
    slots: Semaphore,
    work: Notify,
    records: DashMap<TaskId, watch::Sender<Task>>,
    breakers: Arc<CircuitBreakerRegistry>,
    store: Option<StoreWriter>,
    metrics: Arc<dyn MetricsSink>,
    closed: AtomicBool,
    next_sequence: AtomicU64,
    depth: AtomicUsize,
    running: AtomicUsize,
}

impl TaskQueue {
    pub fn new(config: QueueConfig, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            slots: Semaphore::new(config.capacity),
            config,
            retry: RetryPolicy::default(),
            state: Mutex::new(QueueState::default()),
            work: Notify::new(),
            records: DashMap::new(),
            breakers,
            store: None,
            metrics: Arc::new(NoopMetrics),
            closed: AtomicBool::new(false),
            next_sequence: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
        }
    }

    /// Backoff used by [`retry_or_fail`](Self::retry_or_fail) and [`reclaim`](Self::reclaim)
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(StoreWriter::new(store, self.metrics.clone()));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.store = self.store.take().map(|w| w.with_metrics(metrics.clone()));
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Validate `spec` and add it as a `Pending` task
    pub async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId, QueueError> {
        self.enqueue_with_deadline(spec, None).await
    }

    /// Like [`enqueue`](Self::enqueue), with a caller deadline for the block policy
    ///
    /// The deadline replaces the configured `max_wait` when the queue is full.
    #[instrument(skip(self, spec), fields(resource_type = %spec.resource_type, priority = spec.priority))]
    pub async fn enqueue_with_deadline(
        &self,
        spec: TaskSpec,
        deadline: Option<Duration>,
    ) -> Result<TaskId, QueueError> {
        spec.validate()?;
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        // Dropped (and returned) if the caller goes away before the insert
        let slot = self.acquire_slot(deadline).await?;

        let mut guard = self.state.lock().await;
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let task = Task::from_spec(spec, sequence);
        let id = task.id;
        let resource_type = task.resource_type.clone();

        self.publish(&task);
        let saved = self.persist(&task);
        guard.ready.push(ReadyEntry::of(&task));
        guard.queued.insert(
            id,
            Queued {
                task,
                holds_slot: true,
            },
        );
        slot.forget();
        self.sync_depth(&guard);
        drop(guard);

        self.metrics.increment_counter(
            metrics::TASKS_SUBMITTED,
            &[("resource_type", resource_type.as_str())],
            1,
        );
        self.work.notify_one();
        debug!(task_id = %id, "Task enqueued");
        saved.applied().await;
        Ok(id)
    }

    async fn acquire_slot(
        &self,
        deadline: Option<Duration>,
    ) -> Result<SemaphorePermit<'_>, QueueError> {
        let permit = match self.slots.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(QueueError::Closed),
            Err(TryAcquireError::NoPermits) => match self.config.backpressure {
                BackpressurePolicy::Reject => {
                    return Err(QueueError::QueueFull {
                        capacity: self.config.capacity,
                    })
                }
                BackpressurePolicy::Block { max_wait } => {
                    let wait = deadline.unwrap_or(max_wait);
                    debug!(?wait, "Queue full, waiting for space");
                    match tokio::time::timeout(wait, self.slots.acquire()).await {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => return Err(QueueError::Closed),
                        Err(_) => return Err(QueueError::EnqueueTimeout(wait)),
                    }
                }
            },
        };
        Ok(permit)
    }

    // =========================================================================
    // Worker side
    // =========================================================================

    /// Claim the highest-priority eligible task for `worker_id`
    ///
    /// Ties go to the task enqueued first. Retries are eligible once their
    /// backoff has elapsed. Under [`CircuitOpenPolicy::Defer`] tasks whose
    /// breaker would refuse them are skipped and stay queued.
    pub async fn dequeue(&self, worker_id: &str) -> Option<ClaimedTask> {
        if self.is_closed() {
            return None;
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.promote_due(Instant::now());

        let defer = self.config.circuit_open_policy == CircuitOpenPolicy::Defer;
        let mut skipped = Vec::new();
        let mut picked = None;
        while let Some(entry) = state.ready.pop() {
            // Cancelled tasks leave stale heap entries behind
            let Some(queued) = state.queued.get(&entry.id) else {
                continue;
            };
            if defer && self.breakers.is_blocking(&queued.task.resource_type) {
                skipped.push(entry);
                continue;
            }
            picked = Some(entry.id);
            break;
        }
        state.ready.extend(skipped);

        let Queued {
            mut task,
            holds_slot,
        } = state.queued.remove(&picked?)?;
        if holds_slot {
            self.slots.add_permits(1);
        }

        if let Err(e) = task.transition(TaskState::Running) {
            warn!(task_id = %task.id, error = %e, "Dropping task in unexpected state");
            return None;
        }
        task.attempt_count += 1;
        task.start_time = Some(Utc::now());
        task.end_time = None;
        task.eligible_at = None;
        task.worker_id = Some(worker_id.to_string());

        let cancel = CancellationToken::new();
        state.running.insert(
            task.id,
            Lease {
                worker_id: worker_id.to_string(),
                attempt: task.attempt_count,
                cancel: cancel.clone(),
            },
        );

        self.publish(&task);
        let saved = self.persist(&task);
        self.sync_depth(state);
        drop(guard);
        saved.applied().await;

        if task.attempt_count == 1 {
            if let Some(wait) = task.queue_wait() {
                self.metrics.record_histogram(
                    metrics::TASK_QUEUE_WAIT,
                    &[("resource_type", task.resource_type.as_str())],
                    wait.as_secs_f64(),
                );
            }
        }

        debug!(
            task_id = %task.id,
            worker_id,
            attempt = task.attempt_count,
            priority = task.priority,
            "Task dequeued"
        );
        Some(ClaimedTask { task, cancel })
    }

    /// Wait until new work may be available
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.work.notified()
    }

    /// Mark a running task `Succeeded`
    ///
    /// If cancellation was requested during the attempt the result is
    /// discarded and the task ends `Cancelled`.
    pub async fn complete(
        &self,
        task: Task,
        result: serde_json::Value,
    ) -> Result<TaskState, QueueError> {
        self.settle(task, Settle::Succeed(result)).await
    }

    /// Mark a running task `Failed`, regardless of remaining attempts
    pub async fn fail(&self, task: Task, error: TaskError) -> Result<TaskState, QueueError> {
        self.settle(task, Settle::Fail(error)).await
    }

    /// Return a running task to the queue as `Retrying`, eligible after `delay`
    pub async fn requeue(
        &self,
        task: Task,
        error: TaskError,
        delay: Duration,
    ) -> Result<TaskState, QueueError> {
        self.settle(task, Settle::Retry(error, Some(delay))).await
    }

    /// Requeue if `error` is retryable and attempts remain, otherwise fail
    ///
    /// `delay` overrides the retry policy's backoff.
    pub async fn retry_or_fail(
        &self,
        task: Task,
        error: TaskError,
        delay: Option<Duration>,
    ) -> Result<TaskState, QueueError> {
        self.settle(task, Settle::RetryOrFail(error, delay)).await
    }

    /// Mark a running task `Cancelled` after its worker stopped the attempt
    pub async fn finish_cancelled(
        &self,
        task: Task,
        error: TaskError,
    ) -> Result<TaskState, QueueError> {
        self.settle(task, Settle::Cancel(error)).await
    }

    async fn settle(&self, mut task: Task, outcome: Settle) -> Result<TaskState, QueueError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let lease = state.take_lease(&task)?;
        task.cancel_requested = lease.cancel.is_cancelled();

        let outcome = match outcome {
            Settle::Cancel(error) => Settle::Cancel(error),
            _ if task.cancel_requested => Settle::Cancel(TaskError::new(
                TaskErrorKind::Cancelled,
                "cancelled while running",
            )),
            Settle::RetryOrFail(error, delay) => {
                if error.is_retryable() && task.attempts_remaining() {
                    Settle::Retry(error, delay)
                } else {
                    Settle::Fail(error)
                }
            }
            other => other,
        };

        let result = match outcome {
            Settle::Succeed(value) => {
                task.result = Some(value);
                self.finish(state, task, TaskState::Succeeded, None)
            }
            Settle::Fail(error) => self.finish(state, task, TaskState::Failed, Some(error)),
            Settle::Cancel(error) => self.finish(state, task, TaskState::Cancelled, Some(error)),
            Settle::Retry(error, delay) | Settle::RetryOrFail(error, delay) => {
                let delay = delay.unwrap_or_else(|| self.retry.backoff(task.attempt_count));
                self.requeue_locked(state, task, error, delay)
            }
        };
        drop(guard);
        self.work.notify_one();

        let (next, saved) = result?;
        saved.applied().await;
        Ok(next)
    }

    fn requeue_locked(
        &self,
        state: &mut QueueState,
        mut task: Task,
        error: TaskError,
        delay: Duration,
    ) -> Result<(TaskState, PendingWrite), QueueError> {
        if self.is_closed() {
            let error = TaskError::new(
                TaskErrorKind::Shutdown,
                format!("pool shut down before retry ({error})"),
            );
            return self.finish(state, task, TaskState::Cancelled, Some(error));
        }
        if !task.attempts_remaining() {
            return self.finish(state, task, TaskState::Failed, Some(error));
        }

        task.transition(TaskState::Retrying)?;
        let eligible_at = Instant::now() + delay;
        task.eligible_at = Some(eligible_at);
        task.error = Some(error);

        self.publish(&task);
        let saved = self.persist(&task);

        // Retries never wait for capacity; they only take a free slot
        let holds_slot = match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        };

        if delay.is_zero() {
            state.ready.push(ReadyEntry::of(&task));
        } else {
            state
                .delayed
                .push(Reverse((eligible_at, task.sequence, task.id)));
        }

        info!(
            task_id = %task.id,
            attempt = task.attempt_count,
            max_attempts = task.max_attempts,
            ?delay,
            error = ?task.error.as_ref().map(|e| e.kind),
            "Task scheduled for retry"
        );
        self.metrics.increment_counter(
            metrics::TASKS_RETRIED,
            &[("resource_type", task.resource_type.as_str())],
            1,
        );

        state.queued.insert(task.id, Queued { task, holds_slot });
        self.sync_depth(state);
        Ok((TaskState::Retrying, saved))
    }

    /// Move a task to a terminal state; the caller awaits the returned write
    /// once the queue lock is released
    fn finish(
        &self,
        state: &QueueState,
        mut task: Task,
        next: TaskState,
        error: Option<TaskError>,
    ) -> Result<(TaskState, PendingWrite), QueueError> {
        task.transition(next)?;
        task.end_time = Some(Utc::now());
        task.eligible_at = None;
        task.error = error;

        self.publish(&task);
        let saved = self.persist(&task);
        self.sync_depth(state);

        let labels = [("resource_type", task.resource_type.as_str())];
        let counter = match next {
            TaskState::Succeeded => metrics::TASKS_SUCCEEDED,
            TaskState::Failed => metrics::TASKS_FAILED,
            _ => metrics::TASKS_CANCELLED,
        };
        self.metrics.increment_counter(counter, &labels, 1);
        if let Some(latency) = task.run_time() {
            self.metrics
                .record_histogram(metrics::TASK_LATENCY, &labels, latency.as_secs_f64());
        }

        match next {
            TaskState::Succeeded => info!(
                task_id = %task.id,
                attempt = task.attempt_count,
                "Task succeeded"
            ),
            TaskState::Failed => warn!(
                task_id = %task.id,
                attempt = task.attempt_count,
                error = ?task.error,
                "Task failed"
            ),
            _ => info!(task_id = %task.id, "Task cancelled"),
        }
        Ok((next, saved))
    }

    // =========================================================================
    // Cancellation and recovery
    // =========================================================================

    /// Cancel a task
    ///
    /// Pending and retrying tasks become `Cancelled` immediately. Running
    /// tasks are signalled and end `Cancelled` once their worker stops.
    /// Returns `false` for unknown or already finished tasks.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: TaskId) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if let Some(Queued { task, holds_slot }) = state.queued.remove(&id) {
            if holds_slot {
                self.slots.add_permits(1);
            }
            let error = TaskError::new(TaskErrorKind::Cancelled, "cancelled by caller");
            let saved = match self.finish(state, task, TaskState::Cancelled, Some(error)) {
                Ok((_, saved)) => saved,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Failed to cancel queued task");
                    PendingWrite::none()
                }
            };
            drop(guard);
            saved.applied().await;
            return true;
        }

        if let Some(lease) = state.running.get(&id) {
            lease.cancel.cancel();
            let saved = match self.status(id) {
                Some(mut snapshot) => {
                    snapshot.cancel_requested = true;
                    self.publish(&snapshot);
                    self.persist(&snapshot)
                }
                None => PendingWrite::none(),
            };
            drop(guard);
            info!(task_id = %id, "Cancellation requested for running task");
            saved.applied().await;
            return true;
        }

        false
    }

    /// Return the task a lost worker was running to the queue
    ///
    /// Only acts if `worker_id` still holds the lease. The task is retried
    /// with backoff if attempts remain, otherwise it fails.
    pub async fn reclaim(
        &self,
        id: TaskId,
        worker_id: &str,
        error: TaskError,
    ) -> Option<TaskState> {
        let task = {
            let guard = self.state.lock().await;
            let lease = guard.running.get(&id)?;
            if lease.worker_id != worker_id {
                return None;
            }
            let mut task = self.status(id)?;
            task.attempt_count = lease.attempt;
            task.worker_id = Some(worker_id.to_string());
            task
        };

        match self.retry_or_fail(task, error, None).await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(task_id = %id, worker_id, error = %e, "Failed to reclaim task");
                None
            }
        }
    }

    /// Tasks currently leased to `worker_id`
    pub async fn leases_of(&self, worker_id: &str) -> Vec<TaskId> {
        self.state
            .lock()
            .await
            .running
            .iter()
            .filter(|(_, lease)| lease.worker_id == worker_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Stop accepting submissions and wake blocked submitters
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        self.slots.close();
        self.work.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    /// Cancel every pending and retrying task
    pub async fn cancel_pending(&self, error: TaskError) -> Vec<TaskId> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let queued: Vec<Queued> = state.queued.drain().map(|(_, q)| q).collect();
        state.ready.clear();
        state.delayed.clear();

        let mut cancelled = Vec::with_capacity(queued.len());
        let mut writes = Vec::with_capacity(queued.len());
        for Queued { task, holds_slot } in queued {
            if holds_slot {
                self.slots.add_permits(1);
            }
            let id = task.id;
            match self.finish(state, task, TaskState::Cancelled, Some(error.clone())) {
                Ok((_, saved)) => {
                    cancelled.push(id);
                    writes.push(saved);
                }
                Err(e) => warn!(task_id = %id, error = %e, "Failed to cancel queued task"),
            }
        }
        drop(guard);

        for saved in writes {
            saved.applied().await;
        }
        cancelled
    }

    /// Signal cancellation to every running task; returns how many were signalled
    pub async fn cancel_running(&self) -> usize {
        let guard = self.state.lock().await;
        for lease in guard.running.values() {
            lease.cancel.cancel();
        }
        guard.running.len()
    }

    /// Force every task still leased to a worker into `Cancelled`
    ///
    /// Used after workers have been torn down; their late reports are
    /// rejected as stale.
    pub async fn abandon_running(&self, error: TaskError) -> Vec<TaskId> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let leases: Vec<(TaskId, Lease)> = state.running.drain().collect();

        let mut abandoned = Vec::with_capacity(leases.len());
        let mut writes = Vec::with_capacity(leases.len());
        for (id, lease) in leases {
            let Some(mut task) = self.status(id) else {
                continue;
            };
            task.attempt_count = lease.attempt;
            task.cancel_requested = lease.cancel.is_cancelled();
            match self.finish(state, task, TaskState::Cancelled, Some(error.clone())) {
                Ok((_, saved)) => {
                    abandoned.push(id);
                    writes.push(saved);
                }
                Err(e) => warn!(task_id = %id, error = %e, "Failed to abandon running task"),
            }
        }
        drop(guard);

        for saved in writes {
            saved.applied().await;
        }
        abandoned
    }

    /// Re-enqueue records loaded from a store after a restart
    ///
    /// Tasks that were `Running` when the previous process stopped become
    /// `Retrying` if attempts remain, otherwise `Failed` with `WorkerLost`.
    /// Returns the number of tasks placed back in the queue.
    pub async fn restore(&self, tasks: Vec<Task>) -> Result<usize, QueueError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut restored = 0;
        let mut writes = Vec::with_capacity(tasks.len());

        for mut task in tasks {
            if task.is_terminal() || self.records.contains_key(&task.id) {
                continue;
            }
            task.sequence = self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed);
            task.eligible_at = None;

            if task.state == TaskState::Running {
                let error = TaskError::new(
                    TaskErrorKind::WorkerLost,
                    format!("process stopped during attempt {}", task.attempt_count),
                );
                if task.cancel_requested {
                    task.transition(TaskState::Cancelled)?;
                    task.end_time = Some(Utc::now());
                    task.error = Some(TaskError::new(
                        TaskErrorKind::Cancelled,
                        "cancelled before restart",
                    ));
                } else if task.attempts_remaining() {
                    task.transition(TaskState::Retrying)?;
                    task.error = Some(error);
                } else {
                    task.transition(TaskState::Failed)?;
                    task.end_time = Some(Utc::now());
                    task.error = Some(error);
                }
            }

            self.publish(&task);
            writes.push(self.persist(&task));
            if task.is_terminal() {
                continue;
            }

            let holds_slot = match self.slots.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            };
            state.ready.push(ReadyEntry::of(&task));
            state.queued.insert(task.id, Queued { task, holds_slot });
            restored += 1;
        }

        self.sync_depth(state);
        drop(guard);
        if restored > 0 {
            info!(restored, "Restored tasks from store");
            self.work.notify_waiters();
        }
        for saved in writes {
            saved.applied().await;
        }
        Ok(restored)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Latest snapshot of a task, without taking the queue lock
    pub fn status(&self, id: TaskId) -> Option<Task> {
        self.records.get(&id).map(|tx| tx.borrow().clone())
    }

    /// Receiver that observes every state change of a task
    pub fn subscribe(&self, id: TaskId) -> Option<watch::Receiver<Task>> {
        self.records.get(&id).map(|tx| tx.subscribe())
    }

    /// Pending plus retrying tasks
    pub fn depth(&self) -> usize {
        self.depth.load(AtomicOrdering::Relaxed)
    }

    /// Tasks currently leased to workers
    pub fn running_len(&self) -> usize {
        self.running.load(AtomicOrdering::Relaxed)
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for entry in self.records.iter() {
            counts.add(entry.value().borrow().state);
        }
        counts
    }

    /// Drop terminal records that ended more than `older_than` ago
    pub async fn prune_finished(&self, older_than: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = Utc::now() - age;

        let expired: Vec<TaskId> = self
            .records
            .iter()
            .filter(|entry| {
                let task = entry.value().borrow();
                task.is_terminal() && task.end_time.is_some_and(|end| end <= cutoff)
            })
            .map(|entry| *entry.key())
            .collect();

        let mut writes = Vec::with_capacity(expired.len());
        for id in &expired {
            self.records.remove(id);
            if let Some(store) = &self.store {
                writes.push(store.remove(*id));
            }
        }
        if !expired.is_empty() {
            debug!(pruned = expired.len(), "Pruned finished task records");
        }
        for removed in writes {
            removed.applied().await;
        }
        expired.len()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn publish(&self, task: &Task) {
        match self.records.get(&task.id) {
            Some(tx) => {
                tx.send_replace(task.clone());
            }
            None => {
                let (tx, _) = watch::channel(task.clone());
                self.records.insert(task.id, tx);
            }
        }
    }

    /// Queue a store write of `task`; it is applied even if the caller is cancelled
    fn persist(&self, task: &Task) -> PendingWrite {
        match &self.store {
            Some(store) => store.save(task),
            None => PendingWrite::none(),
        }
    }

    fn sync_depth(&self, state: &QueueState) {
        let depth = state.queued.len();
        self.depth.store(depth, AtomicOrdering::Relaxed);
        self.running
            .store(state.running.len(), AtomicOrdering::Relaxed);
        self.metrics
            .set_gauge(metrics::QUEUE_DEPTH, &[], depth as f64);
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("config", &self.config)
            .field("depth", &self.depth())
            .field("running", &self.running_len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
