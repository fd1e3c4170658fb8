//! Executor abstractions
//!
//! Executors perform the external work behind a task. They:
//! - Receive the task payload and an [`ExecutionContext`]
//! - Report [`ExecutorError::Transient`] failures to be retried and
//!   [`ExecutorError::Permanent`] failures to fail the task outright
//! - Observe cancellation via the context

mod context;
mod definition;
mod registry;

pub use context::ExecutionContext;
pub use definition::{Executor, ExecutorError, FnExecutor};
pub use registry::ExecutorRegistry;
