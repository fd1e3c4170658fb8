//! Single worker loop
//!
//! ```text
//!        ┌──────── retire / Dead ────────► Draining ──► Dead
//!        │
//!  Idle ─┴─ dequeue ──► Busy ──► executor (deadline, cancel grace)
//!   ▲                                │
//!   └──── complete / retry / fail ◄──┘
//! ```
//!
//! A worker runs one task at a time. The executor is spawned on its own
//! tokio task so a timeout or a cancellation past its grace period can
//! abort it; the handle aborts on drop, so an executor never outlives the
//! worker that started it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::poller::IdleBackoff;
use super::pool::PoolConfig;
use super::record::{SharedRecord, WorkerStatus};
use crate::executor::{ExecutionContext, ExecutorRegistry};
use crate::queue::{CircuitOpenPolicy, ClaimedTask, QueueError, TaskQueue};
use crate::task::{Task, TaskError, TaskErrorKind, TaskId, TaskState};

/// Smallest requeue delay for a deferred circuit-open attempt
///
/// `retry_in` is zero while another attempt holds the half-open trial, which
/// would otherwise requeue the task as immediately eligible and spin.
const MIN_DEFER_DELAY: Duration = Duration::from_millis(50);

/// How one attempt ended, before the queue settles it
enum Outcome {
    Success(serde_json::Value),
    Failure(TaskError, Option<Duration>),
    Cancelled(TaskError),
}

pub(crate) struct Worker {
    id: String,
    record: SharedRecord,
    queue: Arc<TaskQueue>,
    executors: Arc<ExecutorRegistry>,
    heartbeat_interval: Duration,
    cancel_grace: Duration,
    backoff: IdleBackoff,
    retire: CancellationToken,
}

impl Worker {
    pub(crate) fn new(
        record: SharedRecord,
        queue: Arc<TaskQueue>,
        executors: Arc<ExecutorRegistry>,
        config: &PoolConfig,
        retire: CancellationToken,
    ) -> Self {
        let id = record.lock().worker_id.clone();
        Self {
            id,
            record,
            queue,
            executors,
            heartbeat_interval: config.heartbeat_interval,
            cancel_grace: config.cancel_grace,
            backoff: IdleBackoff::new(config.poller.clone()),
            retire,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");
        let queue = self.queue.clone();
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.retire.is_cancelled() || self.is_dead() {
                break;
            }
            self.set_status(WorkerStatus::Idle, None);

            let claimed = {
                // Register for wake-ups before looking, so an enqueue between
                // the empty dequeue and the select is not missed
                let notified = queue.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match queue.dequeue(&self.id).await {
                    Some(claimed) => Some(claimed),
                    None if queue.is_closed() => break,
                    None => {
                        let wait = self.backoff.next();
                        let woken = tokio::select! {
                            _ = self.retire.cancelled() => break,
                            _ = &mut notified => true,
                            _ = sleep(wait) => false,
                            _ = heartbeat.tick() => false,
                        };
                        if woken {
                            self.backoff.reset();
                        }
                        None
                    }
                }
            };

            if let Some(claimed) = claimed {
                self.backoff.reset();
                self.process(claimed, &mut heartbeat).await;
            }
        }

        self.set_status(WorkerStatus::Draining, None);
        self.set_status(WorkerStatus::Dead, None);
        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, claimed: ClaimedTask, heartbeat: &mut Interval) {
        let ClaimedTask { task, cancel } = claimed;
        self.set_status(WorkerStatus::Busy, Some(task.id));

        let span = info_span!(
            "task",
            task_id = %task.id,
            worker_id = %self.id,
            resource_type = %task.resource_type,
            attempt = task.attempt_count,
        );
        let outcome = self
            .attempt(&task, &cancel, heartbeat)
            .instrument(span.clone())
            .await;
        self.report(task, outcome).instrument(span).await;
    }

    async fn attempt(
        &self,
        task: &Task,
        cancel: &CancellationToken,
        heartbeat: &mut Interval,
    ) -> Outcome {
        let operation = task.payload.operation.as_str();
        let Some(executor) = self.executors.get(operation) else {
            warn!(operation, "No executor registered for operation");
            return Outcome::Failure(
                TaskError::new(
                    TaskErrorKind::UnknownOperation,
                    format!("no executor registered for operation '{operation}'"),
                ),
                None,
            );
        };

        let breakers = self.queue.breakers();
        let permit = match breakers.acquire(&task.resource_type) {
            Ok(permit) => permit,
            Err(open) => {
                let delay = match self.queue.config().circuit_open_policy {
                    CircuitOpenPolicy::FailFast => None,
                    CircuitOpenPolicy::Defer => Some(open.retry_in.max(MIN_DEFER_DELAY)),
                };
                debug!(state = %open.state, retry_in = ?open.retry_in, "Circuit breaker refused attempt");
                return Outcome::Failure(
                    TaskError::new(TaskErrorKind::CircuitOpen, open.to_string()),
                    delay,
                );
            }
        };

        if cancel.is_cancelled() {
            breakers.release(permit);
            return Outcome::Cancelled(self.cancel_error());
        }

        let ctx = ExecutionContext::for_attempt(task, &self.id, cancel.clone());
        let deadline = ctx.deadline;
        let payload = task.payload.clone();
        let mut handle = AbortOnDropHandle::new(tokio::spawn(async move {
            executor.execute(&payload, &ctx).await
        }));

        let mut grace: Option<Instant> = None;
        let mut retiring = false;
        let outcome = loop {
            let grace_at = grace;
            let grace_elapsed = async move {
                match grace_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                joined = &mut handle => {
                    break match joined {
                        Ok(Ok(value)) => Outcome::Success(value),
                        Ok(Err(e)) => {
                            debug!(error = %e, "Executor returned error");
                            Outcome::Failure(e.into(), None)
                        }
                        Err(e) => {
                            warn!(error = %e, "Executor panicked");
                            Outcome::Failure(
                                TaskError::new(TaskErrorKind::Executor, format!("executor panicked: {e}")),
                                None,
                            )
                        }
                    };
                }
                _ = sleep_until(deadline) => {
                    handle.abort();
                    warn!(timeout = ?task.timeout, "Attempt timed out");
                    break Outcome::Failure(TaskError::timeout(task.timeout), None);
                }
                _ = cancel.cancelled(), if grace.is_none() => {
                    debug!(grace = ?self.cancel_grace, "Cancellation requested, waiting for executor to stop");
                    grace = Some(Instant::now() + self.cancel_grace);
                }
                _ = grace_elapsed => {
                    handle.abort();
                    info!("Executor ignored cancellation, aborted");
                    break Outcome::Cancelled(self.cancel_error());
                }
                _ = heartbeat.tick() => self.beat(),
                _ = self.retire.cancelled(), if !retiring => {
                    retiring = true;
                    self.set_status(WorkerStatus::Draining, Some(task.id));
                }
            }
        };

        match (&outcome, cancel.is_cancelled()) {
            (Outcome::Cancelled(_), _) | (_, true) => breakers.release(permit),
            (Outcome::Success(_), false) => breakers.record_success(permit),
            (Outcome::Failure(..), false) => breakers.record_failure(permit),
        }
        outcome
    }

    async fn report(&self, task: Task, outcome: Outcome) {
        let task_id = task.id;
        let settled = match outcome {
            Outcome::Success(value) => self.queue.complete(task, value).await,
            Outcome::Failure(error, delay) => self.queue.retry_or_fail(task, error, delay).await,
            Outcome::Cancelled(error) => self.queue.finish_cancelled(task, error).await,
        };

        match settled {
            Ok(TaskState::Succeeded) => self.record.lock().tasks_completed += 1,
            Ok(TaskState::Failed) => self.record.lock().tasks_failed += 1,
            Ok(_) => {}
            Err(QueueError::StaleLease(_)) => {
                warn!(%task_id, "Task no longer leased to this worker, discarding outcome");
            }
            Err(e) => error!(%task_id, error = %e, "Failed to report task outcome"),
        }
    }

    fn cancel_error(&self) -> TaskError {
        if self.queue.is_closed() {
            TaskError::new(TaskErrorKind::Shutdown, "cancelled by pool shutdown")
        } else {
            TaskError::new(TaskErrorKind::Cancelled, "cancelled while running")
        }
    }

    fn is_dead(&self) -> bool {
        self.record.lock().status == WorkerStatus::Dead
    }

    fn beat(&self) {
        self.record.lock().beat();
    }

    fn set_status(&self, status: WorkerStatus, current_task_id: Option<TaskId>) {
        let mut record = self.record.lock();
        // The health sweep may already have declared this worker lost
        if record.status == WorkerStatus::Dead {
            return;
        }
        record.status = status;
        record.current_task_id = current_task_id;
        record.beat();
    }
}
