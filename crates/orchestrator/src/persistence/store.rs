//! TaskStore trait definition

use async_trait::async_trait;

use crate::task::{Task, TaskId};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Backend error
    #[error("backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Durable home for task records
///
/// The queue calls [`save`](TaskStore::save) after every state change. Calls
/// come from a single writer task in the order the changes happened, and a
/// change is saved even if the caller that made it is cancelled.
/// On start the orchestrator calls [`load_pending`](TaskStore::load_pending)
/// to re-enqueue work that was pending, retrying or running when the previous
/// process stopped.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Insert or overwrite the record for `task.id`
    async fn save(&self, task: &Task) -> Result<(), StoreError>;

    /// Every record whose state is not terminal
    async fn load_pending(&self) -> Result<Vec<Task>, StoreError>;

    /// Fetch one record
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Drop a finished record
    async fn remove(&self, id: TaskId) -> Result<(), StoreError>;
}
