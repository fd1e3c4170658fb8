//! Executor trait definition

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::ExecutionContext;
use crate::task::{Payload, TaskError, TaskErrorKind};

/// Error type for executor failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// May succeed on another attempt
    #[error("{0}")]
    Transient(String),

    /// Will fail again; the task fails without further attempts
    #[error("{0}")]
    Permanent(String),
}

impl ExecutorError {
    /// Create a retryable error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a non-retryable error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ExecutorError> for TaskError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Transient(message) => TaskError::new(TaskErrorKind::Executor, message),
            ExecutorError::Permanent(message) => TaskError::new(TaskErrorKind::Permanent, message),
        }
    }
}

/// Malformed arguments never fix themselves
impl From<serde_json::Error> for ExecutorError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(format!("invalid arguments: {err}"))
    }
}

/// Performs the external work behind a task
///
/// Executors wrap a scanning tool invocation, an AI API call, or any other
/// opaque operation. They should honor `ctx.deadline` and `ctx.cancelled()`
/// where they can; the worker aborts them when the deadline passes either way.
///
/// # Example
///
/// ```ignore
/// struct PortScan;
///
/// #[async_trait]
/// impl Executor for PortScan {
///     async fn execute(&self, payload: &Payload, ctx: &ExecutionContext) -> Result<Value, ExecutorError> {
///         let target: String = serde_json::from_value(payload.args["target"].clone())?;
///         scan(&target, ctx.remaining()).await.map_err(ExecutorError::transient)
///     }
/// }
/// ```
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, payload: &Payload, ctx: &ExecutionContext)
        -> Result<Value, ExecutorError>;
}

/// Executor backed by an async closure over `(args, ctx)`
pub struct FnExecutor<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnExecutor<F, Fut>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ExecutorError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F, Fut>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ExecutorError>> + Send + 'static,
{
    async fn execute(
        &self,
        payload: &Payload,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutorError> {
        (self.f)(payload.args.clone(), ctx.clone()).await
    }
}
