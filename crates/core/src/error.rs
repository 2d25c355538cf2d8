use std::time::Duration;

use crate::work_item::WorkItemId;

/// The error taxonomy shared across the orchestrator.
///
/// `SpawnFailure` and `WorkerCrash` are recovered locally by the worker
/// pool; `ExecutionTimeout`, `RateLimited` and generic execution errors are
/// recovered by the distributor's retry policy; `QuotaExceeded`,
/// `DependencyFailure` and `ConfigError` surface up to the workflow driver.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("worker spawn failed: {0}")]
    SpawnFailure(String),

    #[error("worker crashed while busy: {0}")]
    WorkerCrash(String),

    #[error("execution deadline of {0:?} exceeded")]
    ExecutionTimeout(Duration),

    #[error("rate limited on service {0:?}")]
    RateLimited(String),

    #[error("quota exceeded for service {0:?}")]
    QuotaExceeded(String),

    #[error("dependency {0} failed permanently, descendants abandoned")]
    DependencyFailure(WorkItemId),

    #[error("invalid service name: {0:?}")]
    InvalidService(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}
