//! Workers and the orchestrator that owns them
//!
//! This module provides:
//! - [`Orchestrator`] - Submission, status, cancellation and shutdown API
//! - [`PoolConfig`] - Pool sizing, heartbeats and grace periods
//! - [`WorkerRecord`] - Per-worker status and counters
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Orchestrator                          │
//! │  ┌──────────────┐   ┌──────────────────────────────────────┐  │
//! │  │  TaskQueue   │◄──┤ Worker 1 │ Worker 2 │ ... │ Worker N  │  │
//! │  │ (priority,   │   │  heartbeat, deadline, cancel grace   │  │
//! │  │  leases)     │   └──────────────────┬───────────────────┘  │
//! │  └──────┬───────┘                      │                      │
//! │         │                 ┌────────────▼───────────┐          │
//! │         │                 │ CircuitBreakerRegistry │          │
//! │         │                 └────────────────────────┘          │
//! │  ┌──────▼─────────────────────────────────────────────────┐   │
//! │  │ Health monitor: lost workers, replacement, scaling     │   │
//! │  └────────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod health;
mod poller;
mod pool;
mod record;
mod runner;

pub use poller::PollerConfig;
pub use pool::{
    Orchestrator, OrchestratorBuilder, OrchestratorError, PoolConfig, PoolStats, PoolStatus,
    ScalingConfig, ShutdownReport,
};
pub use record::{WorkerRecord, WorkerStatus};
