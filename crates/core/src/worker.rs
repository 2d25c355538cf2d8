use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::work_item::WorkItemId;

/// Stable identifier for a worker, preserved across recycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    Error,
    Terminated,
}

/// Point-in-time snapshot of one worker, as returned by `WorkerPool::Stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub state: WorkerState,
    pub current_item: Option<WorkItemId>,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}
