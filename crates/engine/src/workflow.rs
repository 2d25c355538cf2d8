//! Workflow Driver (spec component C5): runs the five-level hierarchical
//! expansion PROJECT → INITIATIVE → FEATURE → STORY → TASK, fanning each
//! completed parent out into its children in parallel, one barrier per
//! level.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use swarmforge_core::{
    Complexity, Event, EventBus, OrchestratorError, Payload, WorkItem, WorkItemBuilder, WorkItemId,
    WorkKind,
};
use tracing::warn;

use crate::distributor::{Distributor, Metrics};
use crate::pool::WorkerPool;

/// Outcome of one dispatched item, as observed by the driver via the event
/// bus (the driver never touches the distributor's internal state).
struct ItemOutcome {
    id: WorkItemId,
    success: bool,
    error: Option<String>,
}

/// Per-level summary in the final [`Report`].
#[derive(Debug, Clone, Serialize)]
pub struct LevelReport {
    pub kind: WorkKind,
    pub succeeded: Vec<WorkItemId>,
    pub failed: Vec<(WorkItemId, String)>,
}

/// Final outcome of one [`WorkflowDriver::run_hierarchy`] call.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub levels: Vec<LevelReport>,
    pub metrics: Metrics,
    pub error: Option<String>,
}

/// Runs one five-level hierarchical expansion to completion.
pub struct WorkflowDriver {
    distributor: Arc<Distributor>,
    pool: Arc<WorkerPool>,
    events: Arc<EventBus>,
    preserve_context: bool,
    max_retries: u32,
    default_task_timeout: Option<Duration>,
    next_id: AtomicU64,
}

impl WorkflowDriver {
    pub fn new(
        distributor: Arc<Distributor>,
        pool: Arc<WorkerPool>,
        events: Arc<EventBus>,
        preserve_context: bool,
        max_retries: u32,
        default_task_timeout: Option<Duration>,
    ) -> Self {
        Self {
            distributor,
            pool,
            events,
            preserve_context,
            max_retries,
            default_task_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> WorkItemId {
        WorkItemId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// `RunHierarchy` — submits a PROJECT item seeded with `seed`, then fans
    /// out INITIATIVE, FEATURE, STORY and TASK children one barrier at a
    /// time, returning the aggregate [`Report`].
    pub async fn run_hierarchy(&self, seed: Payload) -> Result<Report, OrchestratorError> {
        self.events.publish(Event::WorkflowStart);
        let mut levels = Vec::new();

        let project_id = self.next_id();
        let mut project_item = WorkItemBuilder::new(project_id, WorkKind::Project, seed, self.max_retries)
            .complexity(Complexity::Critical)
            .priority(WorkKind::Project.default_priority())
            .build();
        project_item.timeout *= 2;

        let outcomes = self.run_level(vec![project_item]).await;
        let project_ok = outcomes.iter().any(|o| o.id == project_id && o.success);
        levels.push(level_report(WorkKind::Project, &outcomes));

        if !project_ok {
            return Ok(self.abort(levels, "project item failed").await);
        }

        let mut parents: Vec<WorkItemId> = vec![project_id];
        for kind in [WorkKind::Initiative, WorkKind::Feature, WorkKind::Story, WorkKind::Task] {
            let mut next_items = Vec::new();
            for parent_id in &parents {
                let Some(parent_data) = self.distributor.context_for(*parent_id) else {
                    continue;
                };
                for child_payload in extract_children(&parent_data) {
                    let id = self.next_id();
                    let mut builder = WorkItemBuilder::new(id, kind, child_payload, self.max_retries)
                        .parent(*parent_id)
                        .priority(kind.default_priority());
                    if self.preserve_context {
                        if let Some(ctx) = self.distributor.context_for(*parent_id) {
                            builder = builder.context(ctx);
                        }
                    }
                    if kind == WorkKind::Task {
                        if let Some(timeout) = self.default_task_timeout {
                            builder = builder.estimated_duration(timeout);
                        }
                    }
                    next_items.push(builder.build());
                }
            }

            if next_items.is_empty() {
                levels.push(LevelReport {
                    kind,
                    succeeded: Vec::new(),
                    failed: Vec::new(),
                });
                parents = Vec::new();
                continue;
            }

            let outcomes = self.run_level(next_items).await;
            levels.push(level_report(kind, &outcomes));
            parents = outcomes.iter().filter(|o| o.success).map(|o| o.id).collect();
        }

        self.events.publish(Event::WorkflowComplete);
        Ok(Report {
            levels,
            metrics: self.distributor.metrics().await,
            error: None,
        })
    }

    /// Submits `items` and blocks until every one of them has reached a
    /// terminal state (subscribing to the event bus before submission so no
    /// completion/failure can race ahead of the wait).
    async fn run_level(&self, items: Vec<WorkItem>) -> Vec<ItemOutcome> {
        let ids: HashSet<WorkItemId> = items.iter().map(|i| i.id).collect();
        let mut rx = self.events.subscribe();
        self.distributor.submit(items).await;

        let mut outcomes = Vec::with_capacity(ids.len());
        let mut remaining = ids.clone();
        while !remaining.is_empty() {
            match rx.recv().await {
                Ok(Event::WorkCompleted { item_id }) if remaining.remove(&item_id) => {
                    outcomes.push(ItemOutcome {
                        id: item_id,
                        success: true,
                        error: None,
                    });
                }
                Ok(Event::WorkFailed { item_id, error }) if remaining.remove(&item_id) => {
                    outcomes.push(ItemOutcome {
                        id: item_id,
                        success: false,
                        error: Some(error),
                    });
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "workflow driver lagged behind the event bus");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        outcomes
    }

    async fn abort(&self, levels: Vec<LevelReport>, reason: &str) -> Report {
        warn!(%reason, "workflow aborted, tearing down pool");
        self.pool.terminate_all().await;
        self.events.publish(Event::WorkflowError {
            message: reason.to_string(),
        });
        Report {
            levels,
            metrics: self.distributor.metrics().await,
            error: Some(reason.to_string()),
        }
    }
}

fn level_report(kind: WorkKind, outcomes: &[ItemOutcome]) -> LevelReport {
    LevelReport {
        kind,
        succeeded: outcomes.iter().filter(|o| o.success).map(|o| o.id).collect(),
        failed: outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| (o.id, o.error.clone().unwrap_or_default()))
            .collect(),
    }
}

/// Reads the conventional `"children"` array out of a parent's opaque
/// result payload. The payload's contents are otherwise never interpreted —
/// this one well-known key is how the hierarchical expansion finds its next
/// generation of work.
fn extract_children(data: &Payload) -> Vec<Payload> {
    let value: serde_json::Value = match serde_json::from_slice(data.as_bytes()) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let Some(children) = value.get("children").and_then(|c| c.as_array()) else {
        return Vec::new();
    };
    children
        .iter()
        .filter_map(|child| serde_json::to_vec(child).ok())
        .map(Payload::new)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_children_reads_conventional_key() {
        let payload = Payload::new(br#"{"children":[{"a":1},{"a":2}]}"#.to_vec());
        let children = extract_children(&payload);
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn extract_children_missing_key_is_empty() {
        let payload = Payload::new(br#"{"other":true}"#.to_vec());
        assert!(extract_children(&payload).is_empty());
    }

    #[test]
    fn extract_children_malformed_json_is_empty() {
        let payload = Payload::new(b"not json".to_vec());
        assert!(extract_children(&payload).is_empty());
    }
}
