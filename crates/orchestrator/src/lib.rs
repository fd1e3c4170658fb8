//! # HackGPT Task Orchestrator
//!
//! In-process orchestration for long-running scan and analysis jobs.
//!
//! ## Features
//!
//! - **Priority queue**: highest priority first, FIFO within a priority, bounded
//!   with reject or block backpressure
//! - **Worker pool**: bounded concurrency, heartbeats, lost-worker detection
//!   and replacement, optional elastic sizing
//! - **Circuit breakers**: one per resource type, with a single half-open trial
//! - **Retries**: exponential backoff for retryable failures
//! - **Durability hook**: every state change can be written to a [`TaskStore`]
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Orchestrator / TaskBuilder                    │
//! │  (submit, wait, cancel, parallel_map, Pipeline, shutdown)     │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         TaskQueue                             │
//! │  (priority heap, leases, retry timers, task records)          │──▶ TaskStore
//! └──────────────────────────────────────────────────────────────┘
//!                              │ dequeue
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                Workers (+ health monitor)                     │
//! │  breaker check → executor → complete / retry / fail           │──▶ CircuitBreakerRegistry
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use hackgpt_orchestrator::prelude::*;
//! use serde_json::{json, Value};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut executors = ExecutorRegistry::new();
//! executors.register_fn("port_scan", |args: Value, _ctx: ExecutionContext| async move {
//!     Ok(json!({ "host": args["host"], "open": [22, 443] }))
//! });
//!
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), executors)?;
//! orchestrator.start().await?;
//!
//! let handle = orchestrator
//!     .task("port_scan")
//!     .resource("nmap")
//!     .args(json!({ "host": "10.0.0.5" }))
//!     .priority(10)
//!     .submit()
//!     .await?;
//! let report = handle.wait(Duration::from_secs(300)).await?;
//!
//! orchestrator.shutdown(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

mod duration_millis;

pub mod config;
pub mod executor;
pub mod handle;
pub mod metrics;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod submit;
pub mod task;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::OrchestratorConfig;
    pub use crate::executor::{ExecutionContext, Executor, ExecutorError, ExecutorRegistry};
    pub use crate::handle::{TaskHandle, WaitError};
    pub use crate::submit::Pipeline;
    pub use crate::task::{Payload, TaskError, TaskErrorKind, TaskId, TaskSpec, TaskState};
    pub use crate::worker::{Orchestrator, OrchestratorError};
}

// Re-export key types at crate root
pub use config::{ConfigError, OrchestratorConfig};
pub use executor::{ExecutionContext, Executor, ExecutorError, ExecutorRegistry, FnExecutor};
pub use handle::{TaskHandle, WaitError};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, TracingMetrics};
pub use persistence::{InMemoryTaskStore, StoreError, TaskStore};
pub use queue::{
    BackpressurePolicy, CircuitOpenPolicy, ClaimedTask, QueueConfig, QueueError, TaskCounts,
    TaskQueue,
};
pub use reliability::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitOpenError,
    CircuitState, RetryPolicy,
};
pub use submit::{Pipeline, TaskBuilder};
pub use task::{
    Payload, Task, TaskError, TaskErrorKind, TaskId, TaskRecord, TaskSpec, TaskState,
    MAX_PRIORITY, MIN_PRIORITY,
};
pub use worker::{
    Orchestrator, OrchestratorBuilder, OrchestratorError, PollerConfig, PoolConfig, PoolStats,
    PoolStatus, ScalingConfig, ShutdownReport, WorkerRecord, WorkerStatus,
};
