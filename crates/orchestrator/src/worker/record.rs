//! Worker bookkeeping shared between a worker and the pool

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::task::TaskId;

/// Lifecycle status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Waiting for a task
    Idle,
    /// Running a task
    Busy,
    /// Finishing its current task, takes no new work
    Draining,
    /// Stopped, or declared lost by the health sweep
    Dead,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Dead => "dead",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<TaskId>,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,

    /// Monotonic heartbeat used by the health sweep
    #[serde(skip)]
    pub(crate) heartbeat_at: Instant,
}

impl WorkerRecord {
    pub(crate) fn new(worker_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            status: WorkerStatus::Idle,
            current_task_id: None,
            last_heartbeat: now,
            started_at: now,
            tasks_completed: 0,
            tasks_failed: 0,
            heartbeat_at: Instant::now(),
        }
    }

    pub(crate) fn beat(&mut self) {
        self.last_heartbeat = Utc::now();
        self.heartbeat_at = Instant::now();
    }

    /// Time since the last heartbeat
    pub fn silent_for(&self) -> std::time::Duration {
        self.heartbeat_at.elapsed()
    }
}

pub(crate) type SharedRecord = Arc<Mutex<WorkerRecord>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_record_is_idle() {
        let record = WorkerRecord::new("worker-1");
        assert_eq!(record.status, WorkerStatus::Idle);
        assert!(record.current_task_id.is_none());
        assert_eq!(record.tasks_completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_beat_resets_silence() {
        let mut record = WorkerRecord::new("worker-1");
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(record.silent_for(), Duration::from_secs(3));

        record.beat();
        assert_eq!(record.silent_for(), Duration::ZERO);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(WorkerStatus::Draining).unwrap();
        assert_eq!(json, serde_json::json!("draining"));
        assert_eq!(WorkerStatus::Dead.to_string(), "dead");
    }
}
