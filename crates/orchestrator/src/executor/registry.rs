//! Executor registry keyed by operation name

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::{ExecutionContext, Executor, ExecutorError, FnExecutor};

/// Registry of executors
///
/// Maps the `operation` of a task payload to the executor that performs it.
///
/// # Example
///
/// ```
/// use hackgpt_orchestrator::{ExecutorRegistry, ExecutionContext};
/// use serde_json::Value;
///
/// let mut registry = ExecutorRegistry::new();
/// registry.register_fn("echo", |args: Value, _ctx: ExecutionContext| async move { Ok(args) });
/// assert!(registry.contains("echo"));
/// ```
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for `operation`, replacing any previous one
    pub fn register(&mut self, operation: impl Into<String>, executor: impl Executor) -> &mut Self {
        self.executors.insert(operation.into(), Arc::new(executor));
        self
    }

    /// Register an async closure receiving `(args, ctx)`
    pub fn register_fn<F, Fut>(&mut self, operation: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecutorError>> + Send + 'static,
    {
        self.register(operation, FnExecutor::new(f))
    }

    /// Get the executor for `operation`
    pub fn get(&self, operation: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(operation).cloned()
    }

    /// Check if `operation` has an executor
    pub fn contains(&self, operation: &str) -> bool {
        self.executors.contains_key(operation)
    }

    /// Registered operation names
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut operations: Vec<&str> = self.operations().collect();
        operations.sort_unstable();
        f.debug_struct("ExecutorRegistry")
            .field("operations", &operations)
            .finish()
    }
}
