//! Task lifecycle state machine

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task
///
/// ```text
///            ┌──────────────────────────────┐
///            ▼                              │ retryable failure
/// Pending ─► Running ─► Succeeded           │
///    │          │  └──► Failed              │
///    │          └─────► Retrying ───────────┘
///    │          └─────► Cancelled
///    └──────────────────► Cancelled ◄── Retrying
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the queue for its first attempt
    Pending,

    /// Owned by a worker, an attempt is in progress
    Running,

    /// Finished successfully
    Succeeded,

    /// Finished unsuccessfully, no attempts left
    Failed,

    /// Waiting in the queue for another attempt
    Retrying,

    /// Cancelled by a caller or by shutdown
    Cancelled,
}

impl TaskState {
    /// All states, in display order
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Retrying,
        TaskState::Cancelled,
    ];

    /// Terminal states never re-enter the queue
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// States in which the queue owns the task
    pub fn is_queued(self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Pending | Retrying, Running | Cancelled) => true,
            (Running, Succeeded | Failed | Retrying | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
