//! Queue capacity and admission policies

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What `enqueue` does when the queue is at capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Fail immediately with `QueueFull`
    #[default]
    Reject,

    /// Wait up to `max_wait` for space, then fail with `EnqueueTimeout`
    Block {
        #[serde(with = "crate::duration_millis")]
        max_wait: Duration,
    },
}

/// How a tripped circuit breaker affects queued tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitOpenPolicy {
    /// Dequeue ignores breakers; the worker fails the attempt without
    /// invoking the executor
    #[default]
    FailFast,

    /// Dequeue skips tasks whose breaker would refuse them; they stay queued
    /// until the breaker admits a trial
    Defer,
}

/// Task queue configuration
///
/// # Example
///
/// ```
/// use hackgpt_orchestrator::{BackpressurePolicy, QueueConfig};
/// use std::time::Duration;
///
/// let config = QueueConfig::default()
///     .with_capacity(500)
///     .with_backpressure(BackpressurePolicy::Block {
///         max_wait: Duration::from_secs(5),
///     });
/// assert_eq!(config.capacity, 500);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum number of pending and retrying tasks
    pub capacity: usize,

    pub backpressure: BackpressurePolicy,

    pub circuit_open_policy: CircuitOpenPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            backpressure: BackpressurePolicy::Reject,
            circuit_open_policy: CircuitOpenPolicy::FailFast,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    pub fn with_circuit_open_policy(mut self, policy: CircuitOpenPolicy) -> Self {
        self.circuit_open_policy = policy;
        self
    }
}
