//! Executor execution context

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::task::{Task, TaskId};

/// Context provided to executors during an attempt
///
/// The context provides:
/// - Information about the current attempt
/// - The attempt deadline
/// - Cancellation detection
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, payload: &Payload, ctx: &ExecutionContext) -> Result<Value, ExecutorError> {
///     for target in targets(payload)? {
///         if ctx.is_cancelled() {
///             return Err(ExecutorError::permanent("cancelled"));
///         }
///         scan(target, ctx.remaining()).await?;
///     }
///     Ok(json!({"done": true}))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: TaskId,

    /// Current attempt number (1-based)
    pub attempt: u32,

    pub max_attempts: u32,

    pub resource_type: String,

    /// Worker running the attempt
    pub worker_id: String,

    /// Instant after which the attempt is aborted
    pub deadline: Instant,

    cancel: CancellationToken,
}

impl ExecutionContext {
    pub(crate) fn for_attempt(task: &Task, worker_id: &str, cancel: CancellationToken) -> Self {
        Self {
            task_id: task.id,
            attempt: task.attempt_count,
            max_attempts: task.max_attempts,
            resource_type: task.resource_type.clone(),
            worker_id: worker_id.to_string(),
            deadline: Instant::now() + task.timeout,
            cancel,
        }
    }

    /// Context for running an executor outside a worker pool
    ///
    /// Returns the token that cancels the context.
    pub fn standalone(resource_type: impl Into<String>, timeout: Duration) -> (Self, CancellationToken) {
        let cancel = CancellationToken::new();
        let ctx = Self {
            task_id: TaskId::now_v7(),
            attempt: 1,
            max_attempts: 1,
            resource_type: resource_type.into(),
            worker_id: "standalone".to_string(),
            deadline: Instant::now() + timeout,
            cancel: cancel.clone(),
        };
        (ctx, cancel)
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested
    ///
    /// This is useful for select! patterns:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => {
    ///         return Err(ExecutorError::permanent("cancelled"));
    ///     }
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Check if this is the last attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
