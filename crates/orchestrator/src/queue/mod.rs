//! Task queue
//!
//! This module provides:
//! - [`TaskQueue`] - priority queue with leases, retries and backpressure
//! - [`QueueConfig`] - capacity, [`BackpressurePolicy`] and [`CircuitOpenPolicy`]

mod config;
mod task_queue;

pub use config::{BackpressurePolicy, CircuitOpenPolicy, QueueConfig};
pub use task_queue::{ClaimedTask, QueueError, TaskCounts, TaskQueue};
