//! Ordered store writes
//!
//! The queue hands every record change to one writer task. Writes reach the
//! [`TaskStore`] in the order they were submitted and are applied even if
//! the caller that submitted them is cancelled.

use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::store::TaskStore;
use crate::metrics::{self, MetricsSink};
use crate::task::{Task, TaskId};

enum Write {
    Save(Task),
    Remove(TaskId),
}

struct Job {
    write: Write,
    done: oneshot::Sender<()>,
}

/// Completion signal for one submitted write
#[must_use = "await `applied` to observe the write"]
pub(crate) struct PendingWrite(Option<oneshot::Receiver<()>>);

impl PendingWrite {
    /// A write that has nothing to wait for
    pub(crate) fn none() -> Self {
        Self(None)
    }

    /// Wait until the store has processed the write
    ///
    /// Failed writes are logged and counted by the writer.
    pub(crate) async fn applied(self) {
        if let Some(done) = self.0 {
            // Err only if the writer stopped with its runtime
            let _ = done.await;
        }
    }
}

/// Serializes writes to a [`TaskStore`] on a background task
///
/// The task is spawned on first use, from inside the runtime.
pub(crate) struct StoreWriter {
    store: Arc<dyn TaskStore>,
    metrics: Arc<dyn MetricsSink>,
    jobs: OnceLock<mpsc::UnboundedSender<Job>>,
}

impl StoreWriter {
    pub(crate) fn new(store: Arc<dyn TaskStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store,
            metrics,
            jobs: OnceLock::new(),
        }
    }

    pub(crate) fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub(crate) fn save(&self, task: &Task) -> PendingWrite {
        self.submit(Write::Save(task.clone()))
    }

    pub(crate) fn remove(&self, id: TaskId) -> PendingWrite {
        self.submit(Write::Remove(id))
    }

    fn submit(&self, write: Write) -> PendingWrite {
        let jobs = self
            .jobs
            .get_or_init(|| spawn_writer(self.store.clone(), self.metrics.clone()));
        let (done, applied) = oneshot::channel();
        match jobs.send(Job { write, done }) {
            Ok(()) => PendingWrite(Some(applied)),
            Err(_) => {
                warn!("Store writer stopped, write dropped");
                self.metrics.increment_counter(metrics::STORE_ERRORS, &[], 1);
                PendingWrite::none()
            }
        }
    }
}

fn spawn_writer(
    store: Arc<dyn TaskStore>,
    metrics: Arc<dyn MetricsSink>,
) -> mpsc::UnboundedSender<Job> {
    let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
    tokio::spawn(async move {
        while let Some(Job { write, done }) = rx.recv().await {
            match write {
                Write::Save(task) => {
                    if let Err(e) = store.save(&task).await {
                        warn!(task_id = %task.id, state = %task.state, error = %e, "Failed to persist task");
                        metrics.increment_counter(metrics::STORE_ERRORS, &[], 1);
                    }
                }
                Write::Remove(id) => {
                    if let Err(e) = store.remove(id).await {
                        debug!(task_id = %id, error = %e, "Failed to remove task from store");
                    }
                }
            }
            let _ = done.send(());
        }
        debug!("Store writer stopped");
    });
    jobs
}
