//! Task records, submission specs and terminal errors

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TaskState;

/// Unique task identifier (UUID v7, time-ordered, never reused)
pub type TaskId = Uuid;

/// Lowest accepted priority
pub const MIN_PRIORITY: i32 = -1000;

/// Highest accepted priority
pub const MAX_PRIORITY: i32 = 1000;

/// Opaque work descriptor handed to an executor
///
/// The engine only reads `operation` to pick an executor; `args` is passed
/// through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payload {
    /// Executor name, e.g. `"port_scan"` or `"ai_analysis"`
    pub operation: String,

    /// Arguments for the executor
    #[serde(default)]
    pub args: serde_json::Value,
}

impl Payload {
    /// Create a payload with arguments
    pub fn new(operation: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            operation: operation.into(),
            args,
        }
    }

    /// Create a payload without arguments
    pub fn operation(operation: impl Into<String>) -> Self {
        Self::new(operation, serde_json::Value::Null)
    }
}

/// Validation failures for a [`TaskSpec`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskSpecError {
    #[error("priority {priority} outside {min}..={max}")]
    InvalidPriority { priority: i32, min: i32, max: i32 },

    #[error("max_attempts must be greater than zero")]
    InvalidMaxAttempts,

    #[error("timeout must be greater than zero")]
    InvalidTimeout,

    #[error("resource_type must not be empty")]
    EmptyResourceType,

    #[error("payload operation must not be empty")]
    EmptyOperation,
}

/// Everything a caller supplies when submitting work
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use hackgpt_orchestrator::{Payload, TaskSpec};
///
/// let spec = TaskSpec::new("nmap", Payload::operation("port_scan"))
///     .with_priority(10)
///     .with_max_attempts(3)
///     .with_timeout(Duration::from_secs(120));
/// assert!(spec.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    /// Higher values are dequeued first
    #[serde(default)]
    pub priority: i32,

    /// Circuit breaker key
    pub resource_type: String,

    pub payload: Payload,

    /// Total attempts allowed, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Wall-clock limit for a single attempt
    #[serde(with = "crate::duration_millis", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

impl TaskSpec {
    /// Create a spec with priority 0, 3 attempts and a 5 minute timeout
    pub fn new(resource_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            priority: 0,
            resource_type: resource_type.into(),
            payload,
            max_attempts: default_max_attempts(),
            timeout: default_timeout(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check the spec before it is allowed into the queue
    pub fn validate(&self) -> Result<(), TaskSpecError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(TaskSpecError::InvalidPriority {
                priority: self.priority,
                min: MIN_PRIORITY,
                max: MAX_PRIORITY,
            });
        }
        if self.max_attempts == 0 {
            return Err(TaskSpecError::InvalidMaxAttempts);
        }
        if self.timeout.is_zero() {
            return Err(TaskSpecError::InvalidTimeout);
        }
        if self.resource_type.trim().is_empty() {
            return Err(TaskSpecError::EmptyResourceType);
        }
        if self.payload.operation.trim().is_empty() {
            return Err(TaskSpecError::EmptyOperation);
        }
        Ok(())
    }
}

/// Why an attempt or a task failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Attempt exceeded its timeout
    Timeout,

    /// Executor reported a transient error (or panicked)
    Executor,

    /// Executor reported an error that must not be retried
    Permanent,

    /// Resource circuit breaker refused the attempt
    CircuitOpen,

    /// The worker running the attempt stopped sending heartbeats
    WorkerLost,

    /// No executor registered for the payload operation
    UnknownOperation,

    /// Cancelled by a caller
    Cancelled,

    /// Cancelled because the pool shut down
    Shutdown,
}

impl TaskErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Executor | Self::CircuitOpen | Self::WorkerLost
        )
    }
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Executor => "executor",
            Self::Permanent => "permanent",
            Self::CircuitOpen => "circuit_open",
            Self::WorkerLost => "worker_lost",
            Self::UnknownOperation => "unknown_operation",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Failure recorded on a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            TaskErrorKind::Timeout,
            format!("attempt exceeded timeout of {limit:?}"),
        )
    }

    pub fn worker_lost(worker_id: &str) -> Self {
        Self::new(
            TaskErrorKind::WorkerLost,
            format!("worker {worker_id} stopped sending heartbeats"),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

/// Attempted an illegal state change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition for task {id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub id: TaskId,
    pub from: TaskState,
    pub to: TaskState,
}

/// A schedulable unit of work and its lifecycle record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub priority: i32,
    pub resource_type: String,
    pub payload: Payload,
    pub state: TaskState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(with = "crate::duration_millis")]
    pub timeout: Duration,
    pub enqueue_time: DateTime<Utc>,
    /// Start of the most recent attempt
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    /// Terminal error, or the error of the last failed attempt while retrying
    pub error: Option<TaskError>,
    /// Worker currently (or last) running the task
    pub worker_id: Option<String>,
    /// A caller asked to cancel while the task was running
    #[serde(default)]
    pub cancel_requested: bool,

    /// FIFO tie-breaker, assigned by the queue
    #[serde(skip)]
    pub(crate) sequence: u64,

    /// Earliest instant a retry may be dequeued
    #[serde(skip)]
    pub(crate) eligible_at: Option<tokio::time::Instant>,
}

/// Snapshot returned by status queries
pub type TaskRecord = Task;

impl Task {
    /// Build a fresh `Pending` task from a validated spec
    pub(crate) fn from_spec(spec: TaskSpec, sequence: u64) -> Self {
        Self {
            id: Uuid::now_v7(),
            priority: spec.priority,
            resource_type: spec.resource_type,
            payload: spec.payload,
            state: TaskState::Pending,
            attempt_count: 0,
            max_attempts: spec.max_attempts,
            timeout: spec.timeout,
            enqueue_time: Utc::now(),
            start_time: None,
            end_time: None,
            result: None,
            error: None,
            worker_id: None,
            cancel_requested: false,
            sequence,
            eligible_at: None,
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub(crate) fn transition(&mut self, next: TaskState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Time spent in the queue before the latest attempt started
    pub fn queue_wait(&self) -> Option<Duration> {
        self.start_time?
            .signed_duration_since(self.enqueue_time)
            .to_std()
            .ok()
    }

    /// Duration of the latest attempt, once it has ended
    pub fn run_time(&self) -> Option<Duration> {
        self.end_time?
            .signed_duration_since(self.start_time?)
            .to_std()
            .ok()
    }
}
