//! In-memory implementation of TaskStore

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::{StoreError, TaskStore};
use crate::task::{Task, TaskId};

/// In-memory implementation of [`TaskStore`]
///
/// Records are kept as serialized JSON so a reload behaves like a real
/// backend: anything not serialized (queue bookkeeping) is lost.
///
/// # Example
///
/// ```
/// use hackgpt_orchestrator::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// assert_eq!(store.len(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    records: RwLock<HashMap<TaskId, serde_json::Value>>,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Seed the store directly, bypassing the queue
    pub fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let value = serde_json::to_value(task)?;
        self.records.write().insert(task.id, value);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        self.insert(task)
    }

    async fn load_pending(&self) -> Result<Vec<Task>, StoreError> {
        let records = self.records.read();
        let mut tasks = Vec::new();
        for value in records.values() {
            let task: Task = serde_json::from_value(value.clone())?;
            if !task.is_terminal() {
                tasks.push(task);
            }
        }
        tasks.sort_by_key(|t| t.enqueue_time);
        Ok(tasks)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let value = self.records.read().get(&id).cloned();
        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn remove(&self, id: TaskId) -> Result<(), StoreError> {
        self.records
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::TaskNotFound(id))
    }
}
