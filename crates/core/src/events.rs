use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::work_item::WorkItemId;
use crate::worker::WorkerId;

/// Tagged lifecycle event published on the [`EventBus`].
///
/// Every component holds a forward reference to the bus and publishes to it
/// directly — it is the only back-channel between the resource sizer, rate
/// governor, worker pool, distributor and workflow driver, which otherwise
/// hold no references to one another.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    Initialized,

    ResourceCalculated {
        max_workers: usize,
        bottleneck: String,
        rationale: String,
    },

    InstanceCreated {
        worker_id: WorkerId,
    },
    InstanceReady {
        worker_id: WorkerId,
    },
    InstanceReleased {
        worker_id: WorkerId,
    },
    InstanceRecycling {
        worker_id: WorkerId,
    },
    InstanceRecycled {
        worker_id: WorkerId,
    },
    InstanceTerminated {
        worker_id: WorkerId,
    },
    InstanceError {
        worker_id: WorkerId,
        message: String,
    },

    WorkAdded {
        item_id: WorkItemId,
    },
    WorkAssigned {
        item_id: WorkItemId,
        worker_id: WorkerId,
    },
    WorkCompleted {
        item_id: WorkItemId,
    },
    WorkRetry {
        item_id: WorkItemId,
        attempt: u32,
    },
    WorkFailed {
        item_id: WorkItemId,
        error: String,
    },

    QuotaWarning {
        service: String,
        fraction_used: f64,
    },
    QuotaDepleted {
        service: String,
    },
    QuotaReset {
        service: String,
    },
    BackoffSet {
        service: String,
        backoff_ms: u64,
    },
    BackoffCleared {
        service: String,
    },

    WorkflowStart,
    WorkflowComplete,
    WorkflowError {
        message: String,
    },
}

/// In-process publish/subscribe bus.
///
/// Delivery is best-effort and synchronous to subscribers — a publish that
/// finds no subscribers, or a lagging subscriber, is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Best-effort: if there are no subscribers this is a
    /// no-op, not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
