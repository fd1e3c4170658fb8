//! Task model
//!
//! This module provides:
//! - [`TaskSpec`] - What a caller submits
//! - [`Task`] - The lifecycle record the queue and workers pass between them
//! - [`TaskState`] - The lifecycle state machine

mod model;
mod state;

pub use model::{
    InvalidTransition, Payload, Task, TaskError, TaskErrorKind, TaskId, TaskRecord, TaskSpec,
    TaskSpecError, MAX_PRIORITY, MIN_PRIORITY,
};
pub use state::TaskState;
