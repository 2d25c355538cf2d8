use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// Stable identifier for a [`WorkItem`], unique within one workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkItemId(pub u64);

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Level in the five-level hierarchical expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkKind {
    Project,
    Initiative,
    Feature,
    Story,
    Task,
}

impl WorkKind {
    /// The priority a freshly-submitted item of this kind is given by the
    /// workflow driver (PROJECT is most urgent).
    pub fn default_priority(self) -> u32 {
        match self {
            WorkKind::Project => 1,
            WorkKind::Initiative => 2,
            WorkKind::Feature => 3,
            WorkKind::Story => 4,
            WorkKind::Task => 5,
        }
    }

    pub fn child(self) -> Option<WorkKind> {
        match self {
            WorkKind::Project => Some(WorkKind::Initiative),
            WorkKind::Initiative => Some(WorkKind::Feature),
            WorkKind::Feature => Some(WorkKind::Story),
            WorkKind::Story => Some(WorkKind::Task),
            WorkKind::Task => None,
        }
    }
}

/// Complexity class, used both for scheduling order and default timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Complexity {
    Critical,
    High,
    Medium,
    Low,
}

impl Complexity {
    /// Ascending rank used as the secondary sort key in the pending queue
    /// (critical sorts first).
    pub fn rank(self) -> u8 {
        match self {
            Complexity::Critical => 0,
            Complexity::High => 1,
            Complexity::Medium => 2,
            Complexity::Low => 3,
        }
    }

    /// Default per-item timeout when no duration estimate is supplied.
    pub fn default_timeout(self) -> Duration {
        match self {
            Complexity::Low => Duration::from_secs(30),
            Complexity::Medium => Duration::from_secs(60),
            Complexity::High => Duration::from_secs(120),
            Complexity::Critical => Duration::from_secs(180),
        }
    }
}

/// The atomic unit of scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub kind: WorkKind,
    pub parent: Option<WorkItemId>,
    pub depends_on: Vec<WorkItemId>,
    pub priority: u32,
    pub complexity: Complexity,
    pub estimated_duration: Option<Duration>,
    pub input: Payload,
    pub context: Option<Payload>,
    pub retries: u32,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl WorkItem {
    /// `1.5 × estimatedDuration` if one was supplied, else the complexity
    /// default (low 30s, medium 60s, high 120s, critical 180s).
    pub fn dispatch_timeout(&self) -> Duration {
        match self.estimated_duration {
            Some(d) => d.mul_f64(1.5),
            None => self.complexity.default_timeout(),
        }
    }

    /// Boost priority by one step (numerically lower, floor at 1) — used on
    /// retry.
    pub fn boost_priority(&mut self) {
        self.priority = self.priority.saturating_sub(1).max(1);
    }
}

/// Builder for [`WorkItem`]s, mirroring the defaults the workflow driver
/// applies when fanning a parent out into children.
#[derive(Debug, Clone)]
pub struct WorkItemBuilder {
    item: WorkItem,
}

impl WorkItemBuilder {
    pub fn new(id: WorkItemId, kind: WorkKind, input: Payload, max_retries: u32) -> Self {
        let complexity = Complexity::Medium;
        Self {
            item: WorkItem {
                id,
                kind,
                parent: None,
                depends_on: Vec::new(),
                priority: kind.default_priority(),
                complexity,
                estimated_duration: None,
                input,
                context: None,
                retries: 0,
                max_retries,
                timeout: complexity.default_timeout(),
            },
        }
    }

    pub fn parent(mut self, parent: WorkItemId) -> Self {
        self.item.parent = Some(parent);
        self
    }

    pub fn depends_on(mut self, deps: Vec<WorkItemId>) -> Self {
        self.item.depends_on = deps;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.item.priority = priority;
        self
    }

    pub fn complexity(mut self, complexity: Complexity) -> Self {
        self.item.complexity = complexity;
        self.item.timeout = self.item.dispatch_timeout();
        self
    }

    pub fn estimated_duration(mut self, duration: Duration) -> Self {
        self.item.estimated_duration = Some(duration);
        self.item.timeout = self.item.dispatch_timeout();
        self
    }

    pub fn context(mut self, context: Payload) -> Self {
        self.item.context = Some(context);
        self
    }

    pub fn build(self) -> WorkItem {
        self.item
    }
}
