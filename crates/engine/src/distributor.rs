//! Distributor (spec component C4): orders pending work, picks a worker per
//! a configurable strategy, invokes execution, and handles retry/failure.
//!
//! The pending queue, in-progress map and completed/failed sets are mutated
//! only through this module's `Mutex<State>` — no other crate touches them
//! directly. The dispatch tick never blocks on execution: each eligible item
//! is handed to its own spawned task.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use swarmforge_core::{Complexity, Event, EventBus, OrchestratorError, WorkItem, WorkItemId, WorkerId};
use swarmforge_governor::RateGovernor;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::context_store::ContextStore;
use crate::pool::WorkerPool;

/// Work-selection strategy used by [`Distributor::pick_worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LeastLoaded,
    PriorityBased,
    ContextAware,
    Hybrid,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Hybrid
    }
}

/// Tunables for the dispatch loop and retry policy.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub strategy: Strategy,
    pub max_retries: u32,
    pub rate_limited_service: String,
    pub dispatch_batch: usize,
    pub tick_interval: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            max_retries: 3,
            rate_limited_service: "primary-ai".to_string(),
            dispatch_batch: 10,
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// Result of [`Distributor::metrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    pub total: usize,
    pub distributed: u64,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub avg_wait_ms: f64,
    pub avg_exec_ms: f64,
    pub throughput_per_min: f64,
    pub efficiency: f64,
}

/// Result of [`Distributor::status`].
#[derive(Debug, Clone, Serialize)]
pub struct DistributorStatus {
    pub pending: Vec<WorkItemId>,
    pub in_progress: Vec<WorkItemId>,
    pub completed_ids: Vec<WorkItemId>,
    pub failed: usize,
}

struct State {
    pending: Vec<WorkItem>,
    in_progress: HashMap<WorkItemId, WorkerId>,
    completed: HashSet<WorkItemId>,
    failed: HashMap<WorkItemId, String>,
    submitted_at: HashMap<WorkItemId, Instant>,
    per_worker_load: HashMap<WorkerId, u32>,
    affinity: HashMap<WorkItemId, WorkerId>,
    wait_samples_ms: Vec<f64>,
    exec_samples_ms: Vec<f64>,
    distributed: u64,
    round_robin_counter: usize,
    started_at: Option<Instant>,
}

impl State {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            in_progress: HashMap::new(),
            completed: HashSet::new(),
            failed: HashMap::new(),
            submitted_at: HashMap::new(),
            per_worker_load: HashMap::new(),
            affinity: HashMap::new(),
            wait_samples_ms: Vec::new(),
            exec_samples_ms: Vec::new(),
            distributed: 0,
            round_robin_counter: 0,
            started_at: None,
        }
    }

    fn sort_pending(&mut self) {
        self.pending.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.complexity.rank().cmp(&b.complexity.rank()))
                .then(a.depends_on.len().cmp(&b.depends_on.len()))
        });
    }
}

struct Inner {
    pool: Arc<WorkerPool>,
    governor: Arc<RateGovernor>,
    events: Arc<EventBus>,
    context_store: Arc<ContextStore>,
    config: DistributorConfig,
    state: Mutex<State>,
    stopped: AtomicBool,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Accepts work items, orders them, and drives them to completion.
#[derive(Clone)]
pub struct Distributor(Arc<Inner>);

impl Distributor {
    pub fn new(
        config: DistributorConfig,
        pool: Arc<WorkerPool>,
        governor: Arc<RateGovernor>,
        context_store: Arc<ContextStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self(Arc::new(Inner {
            pool,
            governor,
            events,
            context_store,
            config,
            state: Mutex::new(State::new()),
            stopped: AtomicBool::new(false),
            tick_handle: Mutex::new(None),
        }))
    }

    /// `Submit` — enqueues one or more items, re-sorting the pending queue.
    pub async fn submit(&self, items: Vec<WorkItem>) {
        let mut state = self.0.state.lock().await;
        let now = Instant::now();
        for item in items {
            state.submitted_at.insert(item.id, now);
            self.0.events.publish(Event::WorkAdded { item_id: item.id });
            state.pending.push(item);
        }
        state.sort_pending();
    }

    /// `Start` — begins the 100ms dispatch tick.
    pub fn start(&self) {
        let inner = self.0.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                dispatch_once(&inner).await;
            }
        });

        let inner = self.0.clone();
        tokio::spawn(async move {
            let mut state = inner.state.lock().await;
            if state.started_at.is_none() {
                state.started_at = Some(Instant::now());
            }
        });

        // Store the handle synchronously where possible; if the lock is
        // contended this still completes promptly since nothing else holds
        // it for long.
        let inner = self.0.clone();
        tokio::spawn(async move {
            *inner.tick_handle.lock().await = Some(handle);
        });
    }

    /// `Stop` — halts dispatch. Already-executing items run to completion.
    pub async fn stop(&self) {
        self.0.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.0.tick_handle.lock().await.take() {
            handle.abort();
        }
    }

    /// `Metrics`
    pub async fn metrics(&self) -> Metrics {
        let state = self.0.state.lock().await;
        let avg_wait_ms = mean(&state.wait_samples_ms);
        let avg_exec_ms = mean(&state.exec_samples_ms);
        let completed = state.completed.len();
        let failed = state.failed.len();
        let elapsed_min = state
            .started_at
            .map(|t| t.elapsed().as_secs_f64() / 60.0)
            .filter(|m| *m > 0.0);
        let throughput_per_min = elapsed_min.map(|m| completed as f64 / m).unwrap_or(0.0);
        let efficiency = completed as f64 / (state.distributed.max(1) as f64);

        Metrics {
            total: state.pending.len() + state.in_progress.len() + completed + failed,
            distributed: state.distributed,
            pending: state.pending.len(),
            completed,
            failed,
            avg_wait_ms,
            avg_exec_ms,
            throughput_per_min,
            efficiency,
        }
    }

    /// `Status`
    pub async fn status(&self) -> DistributorStatus {
        let state = self.0.state.lock().await;
        DistributorStatus {
            pending: state.pending.iter().map(|i| i.id).collect(),
            in_progress: state.in_progress.keys().copied().collect(),
            completed_ids: state.completed.iter().copied().collect(),
            failed: state.failed.len(),
        }
    }

    /// Context blob produced by a completed item, if any.
    pub fn context_for(&self, item_id: WorkItemId) -> Option<swarmforge_core::Payload> {
        self.0.context_store.get(item_id)
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

async fn dispatch_once(inner: &Arc<Inner>) {
    let eligible = {
        let mut state = inner.state.lock().await;
        let completed = state.completed.clone();
        let mut eligible = Vec::new();
        let mut remaining = Vec::with_capacity(state.pending.len());
        for item in std::mem::take(&mut state.pending) {
            if eligible.len() < inner.config.dispatch_batch
                && item.depends_on.iter().all(|dep| completed.contains(dep))
            {
                eligible.push(item);
            } else {
                remaining.push(item);
            }
        }
        state.pending = remaining;
        eligible
    };

    for item in eligible {
        let inner = inner.clone();
        tokio::spawn(async move {
            run_item(inner, item).await;
        });
    }
}

async fn run_item(inner: Arc<Inner>, item: WorkItem) {
    match inner
        .governor
        .acquire(&inner.config.rate_limited_service, None)
        .await
    {
        Ok(outcome) if !outcome.granted => {
            // Rate limited: stays pending, no retry-counter increment.
            let typed = OrchestratorError::RateLimited(inner.config.rate_limited_service.clone());
            warn!(item_id = %item.id, error = %typed, wait_hint = ?outcome.wait_hint, "dispatch deferred");
            let mut state = inner.state.lock().await;
            state.pending.push(item);
            state.sort_pending();
            return;
        }
        Err(err) => {
            finish_permanently_failed(&inner, item, err.to_string()).await;
            return;
        }
        Ok(_) => {}
    }

    let worker_id = match pick_worker(&inner, &item).await {
        Ok(id) => id,
        Err(err) => {
            handle_failure(&inner, item, err.to_string()).await;
            return;
        }
    };

    {
        let mut state = inner.state.lock().await;
        state.in_progress.insert(item.id, worker_id);
        *state.per_worker_load.entry(worker_id).or_insert(0) += 1;
        state.affinity.insert(item.id, worker_id);
        if let Some(submitted) = state.submitted_at.get(&item.id) {
            state.wait_samples_ms.push(submitted.elapsed().as_secs_f64() * 1000.0);
        }
        state.distributed += 1;
    }

    let mut item_for_execution = item.clone();
    if let Some(parent) = item.parent {
        if item_for_execution.context.is_none() {
            item_for_execution.context = inner.context_store.get(parent);
        }
    }

    let exec_start = Instant::now();
    let result = inner.pool.execute(worker_id, item_for_execution).await;
    // A crashed worker is already torn down by the pool's own supervisor
    // (its record removed, its slot freed); releasing it here would hand a
    // dead id back out via the idle queue.
    if result.is_ok() {
        inner.pool.release(worker_id).await;
    }
    inner
        .governor
        .record(&inner.config.rate_limited_service, None)
        .await;

    {
        let mut state = inner.state.lock().await;
        state.in_progress.remove(&item.id);
        if let Some(load) = state.per_worker_load.get_mut(&worker_id) {
            *load = load.saturating_sub(1);
        }
        state.exec_samples_ms.push(exec_start.elapsed().as_secs_f64() * 1000.0);
    }

    match result {
        Ok(exec_result) if exec_result.success => {
            if let Some(data) = exec_result.data {
                inner.context_store.put(item.id, data);
            }
            let mut state = inner.state.lock().await;
            state.completed.insert(item.id);
            drop(state);
            inner.events.publish(Event::WorkCompleted { item_id: item.id });
        }
        Ok(exec_result) => {
            handle_failure(&inner, item, exec_result.error.unwrap_or_default()).await;
        }
        Err(err) => {
            handle_failure(&inner, item, err.to_string()).await;
        }
    }
}

async fn handle_failure(inner: &Arc<Inner>, mut item: WorkItem, reason: String) {
    if item.retries < item.max_retries {
        item.retries += 1;
        item.boost_priority();
        inner.events.publish(Event::WorkRetry {
            item_id: item.id,
            attempt: item.retries,
        });
        let mut state = inner.state.lock().await;
        state.pending.push(item);
        state.sort_pending();
    } else {
        finish_permanently_failed(inner, item, reason).await;
    }
}

async fn finish_permanently_failed(inner: &Arc<Inner>, item: WorkItem, reason: String) {
    warn!(item_id = %item.id, %reason, "work item permanently failed");
    let descendants = {
        let mut state = inner.state.lock().await;
        state.failed.insert(item.id, reason.clone());
        abandon_descendants(&mut state, item.id)
    };
    inner.events.publish(Event::WorkFailed {
        item_id: item.id,
        error: reason,
    });
    for desc in descendants {
        inner.events.publish(Event::WorkFailed {
            item_id: desc,
            error: format!("abandoned: dependency {} failed permanently", item.id),
        });
    }
}

/// Removes every pending item that (transitively) depends on `failed_id` and
/// records it as failed too, returning the abandoned ids.
fn abandon_descendants(state: &mut State, failed_id: WorkItemId) -> Vec<WorkItemId> {
    let mut frontier = vec![failed_id];
    let mut abandoned = Vec::new();

    while let Some(id) = frontier.pop() {
        let mut remaining = Vec::with_capacity(state.pending.len());
        for item in std::mem::take(&mut state.pending) {
            if item.depends_on.contains(&id) {
                state.failed.insert(item.id, format!("dependency {id} failed permanently"));
                abandoned.push(item.id);
                frontier.push(item.id);
            } else {
                remaining.push(item);
            }
        }
        state.pending = remaining;
    }
    abandoned
}

async fn pick_worker(inner: &Arc<Inner>, item: &WorkItem) -> Result<WorkerId, OrchestratorError> {
    match inner.config.strategy {
        Strategy::RoundRobin => round_robin(inner).await,
        Strategy::LeastLoaded => least_loaded(inner).await,
        Strategy::PriorityBased => {
            if let Some(id) = try_priority_based(inner, item).await {
                Ok(id)
            } else {
                least_loaded(inner).await
            }
        }
        Strategy::ContextAware => {
            if let Some(id) = try_context_aware(inner, item).await {
                Ok(id)
            } else {
                least_loaded(inner).await
            }
        }
        Strategy::Hybrid => {
            if let Some(id) = try_context_aware(inner, item).await {
                return Ok(id);
            }
            if let Some(id) = try_priority_based(inner, item).await {
                return Ok(id);
            }
            if let Some(id) = try_least_loaded(inner).await {
                return Ok(id);
            }
            round_robin(inner).await
        }
    }
}

async fn try_context_aware(inner: &Arc<Inner>, item: &WorkItem) -> Option<WorkerId> {
    let parent = item.parent?;
    let candidate = {
        let state = inner.state.lock().await;
        state.affinity.get(&parent).copied()
    }?;
    inner.pool.try_acquire(candidate).await.then_some(candidate)
}

async fn try_priority_based(inner: &Arc<Inner>, item: &WorkItem) -> Option<WorkerId> {
    if item.priority <= 2 && item.complexity == Complexity::Critical {
        info!(item_id = %item.id, "priority-based strategy spawning dedicated worker");
        match inner.pool.acquire_dedicated(1024, Duration::from_secs(120)).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(item_id = %item.id, error = %err, "dedicated worker spawn failed, falling back");
                None
            }
        }
    } else {
        None
    }
}

async fn try_least_loaded(inner: &Arc<Inner>) -> Option<WorkerId> {
    let idle = inner.pool.idle_ids().await;
    if idle.is_empty() {
        return None;
    }
    let loads = {
        let state = inner.state.lock().await;
        state.per_worker_load.clone()
    };
    let mut candidates = idle;
    candidates.sort_by_key(|id| loads.get(id).copied().unwrap_or(0));
    for id in candidates {
        if inner.pool.try_acquire(id).await {
            return Some(id);
        }
    }
    None
}

async fn least_loaded(inner: &Arc<Inner>) -> Result<WorkerId, OrchestratorError> {
    if let Some(id) = try_least_loaded(inner).await {
        return Ok(id);
    }
    inner.pool.acquire().await
}

async fn round_robin(inner: &Arc<Inner>) -> Result<WorkerId, OrchestratorError> {
    let idle = inner.pool.idle_ids().await;
    if idle.is_empty() {
        return inner.pool.acquire().await;
    }
    let start = {
        let mut state = inner.state.lock().await;
        let i = state.round_robin_counter % idle.len();
        state.round_robin_counter = state.round_robin_counter.wrapping_add(1);
        i
    };
    for offset in 0..idle.len() {
        let candidate = idle[(start + offset) % idle.len()];
        if inner.pool.try_acquire(candidate).await {
            return Ok(candidate);
        }
    }
    inner.pool.acquire().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_queue_sorts_by_priority_then_complexity_then_deps() {
        let mut state = State::new();
        let low_pri_simple = make_item(1, 5, Complexity::Low, vec![]);
        let high_pri = make_item(2, 1, Complexity::Low, vec![]);
        let same_pri_critical = make_item(3, 5, Complexity::Critical, vec![]);
        let same_pri_low_more_deps = make_item(4, 5, Complexity::Low, vec![WorkItemId(1)]);

        state.pending = vec![
            low_pri_simple.clone(),
            high_pri.clone(),
            same_pri_critical.clone(),
            same_pri_low_more_deps.clone(),
        ];
        state.sort_pending();

        let order: Vec<WorkItemId> = state.pending.iter().map(|i| i.id).collect();
        assert_eq!(
            order,
            vec![high_pri.id, same_pri_critical.id, low_pri_simple.id, same_pri_low_more_deps.id]
        );
    }

    #[test]
    fn abandon_descendants_removes_transitive_children() {
        let mut state = State::new();
        let child = make_item(2, 5, Complexity::Low, vec![WorkItemId(1)]);
        let grandchild = make_item(3, 5, Complexity::Low, vec![WorkItemId(2)]);
        let unrelated = make_item(4, 5, Complexity::Low, vec![]);
        state.pending = vec![child, grandchild, unrelated.clone()];

        let abandoned = abandon_descendants(&mut state, WorkItemId(1));
        assert_eq!(abandoned.len(), 2);
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.pending[0].id, unrelated.id);
        assert_eq!(state.failed.len(), 2);
    }

    fn make_item(id: u64, priority: u32, complexity: Complexity, depends_on: Vec<WorkItemId>) -> WorkItem {
        use swarmforge_core::{Payload, WorkKind};
        WorkItem {
            id: WorkItemId(id),
            kind: WorkKind::Task,
            parent: None,
            depends_on,
            priority,
            complexity,
            estimated_duration: None,
            input: Payload::default(),
            context: None,
            retries: 0,
            max_retries: 3,
            timeout: Duration::from_secs(30),
        }
    }
}
