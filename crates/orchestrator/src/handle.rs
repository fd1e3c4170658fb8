//! Handles to submitted tasks

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::queue::TaskQueue;
use crate::task::{Task, TaskError, TaskErrorKind, TaskId, TaskState};

/// Why waiting on a task did not produce a result
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The task was still unfinished when the wait gave up
    #[error("task did not finish within {0:?}")]
    Timeout(Duration),

    #[error("task failed: {0}")]
    Failed(TaskError),

    #[error("task cancelled: {0}")]
    Cancelled(TaskError),

    /// Unknown id, or the record was pruned
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("failed to decode task result: {0}")]
    Decode(String),
}

/// Handle returned by a submission
///
/// Cheap to clone; holds no state beyond the task id.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    queue: Arc<TaskQueue>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, queue: Arc<TaskQueue>) -> Self {
        Self { id, queue }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Latest snapshot of the task
    pub fn status(&self) -> Option<Task> {
        self.queue.status(self.id)
    }

    /// Request cancellation; `false` if the task already finished
    pub async fn cancel(&self) -> bool {
        self.queue.cancel(self.id).await
    }

    /// Wait up to `timeout` for the task to finish and return its result
    pub async fn wait(&self, timeout: Duration) -> Result<Value, WaitError> {
        let task = self.wait_record(timeout).await?;
        let error = || {
            task.error
                .clone()
                .unwrap_or_else(|| TaskError::new(TaskErrorKind::Executor, "no error recorded"))
        };
        match task.state {
            TaskState::Succeeded => Ok(task.result.clone().unwrap_or(Value::Null)),
            TaskState::Cancelled => Err(WaitError::Cancelled(error())),
            _ => Err(WaitError::Failed(error())),
        }
    }

    /// Wait and deserialize the result as `T`
    pub async fn wait_as<T: DeserializeOwned>(&self, timeout: Duration) -> Result<T, WaitError> {
        let value = self.wait(timeout).await?;
        serde_json::from_value(value).map_err(|e| WaitError::Decode(e.to_string()))
    }

    /// Wait for the terminal record, whatever the outcome
    pub async fn wait_record(&self, timeout: Duration) -> Result<Task, WaitError> {
        let mut rx = self
            .queue
            .subscribe(self.id)
            .ok_or(WaitError::NotFound(self.id))?;

        // Bound to a local so the watch guard is dropped before `rx`
        let settled = match tokio::time::timeout(timeout, rx.wait_for(|task| task.is_terminal())).await {
            Ok(Ok(task)) => Ok(task.clone()),
            Ok(Err(_)) => Err(WaitError::NotFound(self.id)),
            Err(_) => Err(WaitError::Timeout(timeout)),
        };
        settled
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}
