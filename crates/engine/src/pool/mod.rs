//! Worker Pool (spec component C3): spawns, tracks, recycles and terminates
//! worker child processes; exposes idle/busy pools and per-worker stats.
//!
//! Pool membership (idle/busy sets, the worker map) is mutated only through
//! this module's `Mutex<PoolState>` — no other crate touches it directly.

mod ipc;
mod spawner;

pub use ipc::{ChildMessage, ParentMessage};
pub use spawner::{ProcessSpawner, SpawnSpec, WorkerChannel, WorkerSpawner};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use swarmforge_core::{
    Event, EventBus, ExecutionResult, OrchestratorError, Payload, WorkItem, WorkerId, WorkerState,
    WorkerStats,
};
use swarmforge_resource::Suggestion;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{info, warn};

/// Tunables for the pool's spawn/recycle/terminate protocol.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub init_timeout: Duration,
    pub terminate_timeout: Duration,
    pub recycle_threshold: u64,
    pub preserve_context: bool,
    pub memory_limit_mb: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            init_timeout: Duration::from_secs(10),
            terminate_timeout: Duration::from_secs(5),
            recycle_threshold: 50,
            preserve_context: true,
            memory_limit_mb: 512,
        }
    }
}

/// Result of [`WorkerPool::stats`].
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub per_worker: Vec<WorkerStats>,
}

enum WorkerCommand {
    Execute {
        item: WorkItem,
        respond: oneshot::Sender<Result<ExecutionResult, OrchestratorError>>,
    },
    Terminate {
        respond: oneshot::Sender<()>,
    },
}

enum WorkerInternalEvent {
    ContextUpdated { worker_id: WorkerId, blob: Payload },
    Log { worker_id: WorkerId, line: String },
    ChildError { worker_id: WorkerId, desc: String },
    Crashed { worker_id: WorkerId },
}

struct WorkerRecord {
    stats: WorkerStats,
    cmd_tx: mpsc::Sender<WorkerCommand>,
    context_blob: Option<Payload>,
    pending_recycle: bool,
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerId, WorkerRecord>,
    idle: VecDeque<WorkerId>,
    busy: std::collections::HashSet<WorkerId>,
    next_id: u64,
    pending_spawns: usize,
}

struct Inner {
    config: PoolConfig,
    spawner: Arc<dyn WorkerSpawner>,
    events: Arc<EventBus>,
    state: Mutex<PoolState>,
    notify: Notify,
    internal_tx: mpsc::UnboundedSender<WorkerInternalEvent>,
    max_workers: AtomicUsize,
}

/// Spawns, tracks, recycles and terminates worker child processes.
pub struct WorkerPool(Arc<Inner>);

impl WorkerPool {
    pub fn new(config: PoolConfig, spawner: Arc<dyn WorkerSpawner>, events: Arc<EventBus>) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let max_workers = AtomicUsize::new(config.max_workers);
        let inner = Arc::new(Inner {
            config,
            spawner,
            events,
            state: Mutex::new(PoolState::default()),
            notify: Notify::new(),
            internal_tx,
            max_workers,
        });
        tokio::spawn(run_supervisor(internal_rx, inner.clone()));
        Self(inner)
    }

    /// `Acquire` — blocks until a worker is available, spawning one if the
    /// pool has headroom under the current `max_workers` ceiling.
    pub async fn acquire(&self) -> Result<WorkerId, OrchestratorError> {
        loop {
            {
                let mut state = self.0.state.lock().await;
                if let Some(id) = state.idle.pop_front() {
                    state.busy.insert(id);
                    if let Some(record) = state.workers.get_mut(&id) {
                        record.stats.state = WorkerState::Busy;
                    }
                    return Ok(id);
                }
                let max_workers = self.0.max_workers.load(Ordering::SeqCst);
                if state.workers.len() + state.pending_spawns < max_workers {
                    state.pending_spawns += 1;
                } else {
                    // Register for the wakeup before dropping the lock so a
                    // release() that runs between the check above and the
                    // await below isn't missed.
                    let notified = self.0.notify.notified();
                    drop(state);
                    notified.await;
                    continue;
                }
            }

            let result = spawn_worker(
                &self.0,
                self.0.config.memory_limit_mb,
                self.0.config.init_timeout.as_millis() as u64,
                true,
                None,
                None,
            )
            .await;
            let mut state = self.0.state.lock().await;
            state.pending_spawns -= 1;
            drop(state);
            return result;
        }
    }

    /// Spawns a brand-new worker with elevated per-task resource limits,
    /// outside the idle pool and outside the `max_workers` ceiling — used by
    /// the distributor's priority-based strategy for urgent,
    /// critical-complexity items that warrant a dedicated instance.
    pub async fn acquire_dedicated(
        &self,
        memory_limit_mb: u64,
        task_timeout: Duration,
    ) -> Result<WorkerId, OrchestratorError> {
        spawn_worker(&self.0, memory_limit_mb, task_timeout.as_millis() as u64, true, None, None).await
    }

    /// `Execute` — runs one work item on an already-acquired worker.
    pub async fn execute(
        &self,
        worker_id: WorkerId,
        item: WorkItem,
    ) -> Result<ExecutionResult, OrchestratorError> {
        let cmd_tx = {
            let mut state = self.0.state.lock().await;
            let record = state
                .workers
                .get_mut(&worker_id)
                .ok_or_else(|| OrchestratorError::WorkerCrash(format!("{worker_id} not found")))?;
            record.stats.current_item = Some(item.id);
            record.stats.last_activity = Utc::now();
            record.cmd_tx.clone()
        };

        self.0.events.publish(Event::WorkAssigned {
            item_id: item.id,
            worker_id,
        });

        let (tx, rx) = oneshot::channel();
        cmd_tx
            .send(WorkerCommand::Execute { item, respond: tx })
            .await
            .map_err(|_| OrchestratorError::WorkerCrash(format!("{worker_id} command channel closed")))?;

        let result = rx
            .await
            .map_err(|_| OrchestratorError::WorkerCrash(format!("{worker_id} dropped without a result")))?;

        let mut state = self.0.state.lock().await;
        if let Some(record) = state.workers.get_mut(&worker_id) {
            record.stats.last_activity = Utc::now();
            match &result {
                Ok(outcome) if outcome.success => record.stats.completed_tasks += 1,
                _ => record.stats.failed_tasks += 1,
            }
            if record.stats.completed_tasks >= self.0.config.recycle_threshold {
                record.pending_recycle = true;
            }
        }
        result
    }

    /// `Release` — returns a worker to the idle pool, or recycles it if it
    /// just crossed its recycle threshold or took a worker-level error.
    pub async fn release(&self, worker_id: WorkerId) {
        let should_recycle = {
            let mut state = self.0.state.lock().await;
            state.busy.remove(&worker_id);
            match state.workers.get_mut(&worker_id) {
                Some(record) => {
                    record.stats.current_item = None;
                    if record.pending_recycle {
                        true
                    } else {
                        record.stats.state = WorkerState::Ready;
                        state.idle.push_back(worker_id);
                        false
                    }
                }
                None => false,
            }
        };
        self.0.events.publish(Event::InstanceReleased { worker_id });
        self.0.notify.notify_waiters();

        if should_recycle {
            recycle_worker(&self.0, worker_id).await;
        }
    }

    /// `Recycle` — terminates a worker and spawns a replacement with the
    /// same identity, carrying its context blob forward if configured.
    pub async fn recycle(&self, worker_id: WorkerId) {
        recycle_worker(&self.0, worker_id).await;
    }

    /// `Terminate` — stops one worker and drops it from the pool entirely.
    pub async fn terminate(&self, worker_id: WorkerId) {
        terminate_worker(&self.0, worker_id).await;
    }

    /// `TerminateAll` — tears down every worker in the pool.
    pub async fn terminate_all(&self) {
        let ids: Vec<WorkerId> = {
            let state = self.0.state.lock().await;
            state.workers.keys().copied().collect()
        };
        for id in ids {
            terminate_worker(&self.0, id).await;
        }
    }

    /// `Recalculate` — applies a resource-sizer [`Suggestion`]. Shrinking
    /// lowers the `max_workers` ceiling and terminates idle workers down to
    /// it, never interrupting a busy one; growing only raises the ceiling,
    /// since new workers spawn lazily on the next `Acquire`.
    pub async fn recalculate(&self, suggestion: &Suggestion) {
        if !suggestion.should_adjust {
            return;
        }
        self.0.max_workers.store(suggestion.suggested, Ordering::SeqCst);
        loop {
            let victim = {
                let mut state = self.0.state.lock().await;
                if state.workers.len() <= suggestion.suggested {
                    None
                } else {
                    state.idle.pop_front()
                }
            };
            match victim {
                Some(id) => terminate_worker(&self.0, id).await,
                None => break,
            }
        }
        self.0.notify.notify_waiters();
    }

    /// Current `max_workers` ceiling, as last set at construction or by
    /// [`WorkerPool::recalculate`].
    pub fn max_workers(&self) -> usize {
        self.0.max_workers.load(Ordering::SeqCst)
    }

    /// Non-blocking attempt to claim a specific idle worker by id, used by
    /// the distributor's context-aware and least-loaded strategies. Returns
    /// `false` without waiting if that worker is not currently idle.
    pub async fn try_acquire(&self, worker_id: WorkerId) -> bool {
        let mut state = self.0.state.lock().await;
        if let Some(pos) = state.idle.iter().position(|id| *id == worker_id) {
            state.idle.remove(pos);
            state.busy.insert(worker_id);
            if let Some(record) = state.workers.get_mut(&worker_id) {
                record.stats.state = WorkerState::Busy;
            }
            true
        } else {
            false
        }
    }

    /// Snapshot of currently-idle worker ids.
    pub async fn idle_ids(&self) -> Vec<WorkerId> {
        let state = self.0.state.lock().await;
        state.idle.iter().copied().collect()
    }

    /// `Stats` — point-in-time snapshot of pool occupancy.
    pub async fn stats(&self) -> PoolStats {
        let state = self.0.state.lock().await;
        PoolStats {
            total: state.workers.len(),
            idle: state.idle.len(),
            busy: state.busy.len(),
            per_worker: state.workers.values().map(|r| r.stats.clone()).collect(),
        }
    }
}

/// Runs the spawn protocol (§4.3) and inserts the resulting record into the
/// pool. `id` pins the identity for a recycle's replacement; `context_blob`
/// seeds the replacement's preserved context. `start_busy` controls whether
/// the new worker lands in the busy set (a dedicated or directly-acquired
/// spawn) or the idle pool (a recycle replacement, reused later).
async fn spawn_worker(
    inner: &Arc<Inner>,
    memory_limit_mb: u64,
    task_timeout_ms: u64,
    start_busy: bool,
    id: Option<WorkerId>,
    context_blob: Option<Payload>,
) -> Result<WorkerId, OrchestratorError> {
    let id = match id {
        Some(id) => id,
        None => {
            let mut state = inner.state.lock().await;
            state.next_id += 1;
            WorkerId(state.next_id)
        }
    };

    let spec = SpawnSpec {
        worker_id: id,
        memory_limit_mb,
        task_timeout_ms,
        preserve_context: inner.config.preserve_context,
    };

    let mut channel = inner.spawner.spawn(&spec).await?;
    match tokio::time::timeout(inner.config.init_timeout, channel.recv()).await {
        Ok(Ok(Some(ChildMessage::Ready))) => {}
        Ok(Ok(other)) => {
            channel.kill().await;
            return Err(OrchestratorError::SpawnFailure(format!(
                "expected READY, got {other:?}"
            )));
        }
        Ok(Err(err)) => {
            channel.kill().await;
            return Err(err);
        }
        Err(_) => {
            channel.kill().await;
            return Err(OrchestratorError::SpawnFailure(format!(
                "worker {id} did not signal READY within {:?}",
                inner.config.init_timeout
            )));
        }
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(1);
    tokio::spawn(run_worker_task(
        id,
        channel,
        cmd_rx,
        inner.internal_tx.clone(),
        inner.config.terminate_timeout,
    ));

    let now = Utc::now();
    {
        let mut state = inner.state.lock().await;
        state.workers.insert(
            id,
            WorkerRecord {
                stats: WorkerStats {
                    id,
                    state: if start_busy { WorkerState::Busy } else { WorkerState::Ready },
                    current_item: None,
                    completed_tasks: 0,
                    failed_tasks: 0,
                    started_at: now,
                    last_activity: now,
                },
                cmd_tx,
                context_blob,
                pending_recycle: false,
            },
        );
        if start_busy {
            state.busy.insert(id);
        } else {
            state.idle.push_back(id);
        }
    }
    inner.events.publish(Event::InstanceCreated { worker_id: id });
    inner.events.publish(Event::InstanceReady { worker_id: id });
    Ok(id)
}

async fn recycle_worker(inner: &Arc<Inner>, worker_id: WorkerId) {
    inner.events.publish(Event::InstanceRecycling { worker_id });

    let preserved_context = {
        let state = inner.state.lock().await;
        state
            .workers
            .get(&worker_id)
            .and_then(|r| r.context_blob.clone())
    };

    terminate_worker(inner, worker_id).await;

    match spawn_worker(
        inner,
        inner.config.memory_limit_mb,
        inner.config.init_timeout.as_millis() as u64,
        false,
        Some(worker_id),
        preserved_context,
    )
    .await
    {
        Ok(_) => {
            inner.events.publish(Event::InstanceRecycled { worker_id });
            inner.notify.notify_waiters();
        }
        Err(err) => {
            warn!(%worker_id, error = %err, "recycle failed to respawn worker");
            inner.events.publish(Event::InstanceError {
                worker_id,
                message: err.to_string(),
            });
        }
    }
}

async fn terminate_worker(inner: &Arc<Inner>, worker_id: WorkerId) {
    let cmd_tx = {
        let mut state = inner.state.lock().await;
        state.idle.retain(|id| *id != worker_id);
        state.busy.remove(&worker_id);
        state.workers.remove(&worker_id).map(|r| r.cmd_tx)
    };

    if let Some(cmd_tx) = cmd_tx {
        let (tx, rx) = oneshot::channel();
        if cmd_tx.send(WorkerCommand::Terminate { respond: tx }).await.is_ok() {
            let _ = tokio::time::timeout(inner.config.terminate_timeout * 2, rx).await;
        }
    }
    inner.events.publish(Event::InstanceTerminated { worker_id });
}

async fn run_supervisor(mut internal_rx: mpsc::UnboundedReceiver<WorkerInternalEvent>, inner: Arc<Inner>) {
    while let Some(event) = internal_rx.recv().await {
        match event {
            WorkerInternalEvent::ContextUpdated { worker_id, blob } => {
                let mut state = inner.state.lock().await;
                if let Some(record) = state.workers.get_mut(&worker_id) {
                    record.context_blob = Some(blob);
                }
            }
            WorkerInternalEvent::Log { worker_id, line } => {
                info!(%worker_id, "{line}");
            }
            WorkerInternalEvent::ChildError { worker_id, desc } => {
                inner.events.publish(Event::InstanceError {
                    worker_id,
                    message: desc,
                });

                // A worker-level error transitions the worker to `error` and
                // triggers an immediate recycle (§4.3's failure semantics).
                // If it's idle right now, recycle it immediately; if it's
                // mid-execution, flag it and `release()` will recycle it
                // once the in-flight item finishes rather than returning it
                // to the idle pool.
                let recycle_now = {
                    let mut state = inner.state.lock().await;
                    match state.workers.get_mut(&worker_id) {
                        Some(record) => {
                            record.stats.state = WorkerState::Error;
                            record.pending_recycle = true;
                            if let Some(pos) = state.idle.iter().position(|id| *id == worker_id) {
                                state.idle.remove(pos);
                                state.busy.insert(worker_id);
                                true
                            } else {
                                false
                            }
                        }
                        None => false,
                    }
                };
                if recycle_now {
                    recycle_worker(&inner, worker_id).await;
                }
            }
            WorkerInternalEvent::Crashed { worker_id } => {
                let mut state = inner.state.lock().await;
                state.idle.retain(|id| *id != worker_id);
                state.busy.remove(&worker_id);
                state.workers.remove(&worker_id);
                drop(state);
                inner.events.publish(Event::InstanceError {
                    worker_id,
                    message: "worker process exited unexpectedly".to_string(),
                });
                inner.notify.notify_waiters();
            }
        }
    }
}

async fn run_worker_task(
    id: WorkerId,
    mut channel: Box<dyn WorkerChannel>,
    mut cmd_rx: mpsc::Receiver<WorkerCommand>,
    internal_tx: mpsc::UnboundedSender<WorkerInternalEvent>,
    terminate_timeout: Duration,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(WorkerCommand::Execute { item, respond }) => {
                        let outcome = execute_one(id, &mut channel, item, &internal_tx).await;
                        let _ = respond.send(outcome);
                    }
                    Some(WorkerCommand::Terminate { respond }) => {
                        let _ = channel.send(ParentMessage::Terminate).await;
                        let _ = tokio::time::timeout(terminate_timeout, drain_until_eof(&mut channel)).await;
                        channel.kill().await;
                        let _ = respond.send(());
                        return;
                    }
                    None => {
                        channel.kill().await;
                        return;
                    }
                }
            }
            msg = channel.recv() => {
                match msg {
                    Ok(Some(ChildMessage::Log { line })) => {
                        let _ = internal_tx.send(WorkerInternalEvent::Log { worker_id: id, line });
                    }
                    Ok(Some(ChildMessage::Context { blob })) => {
                        let _ = internal_tx.send(WorkerInternalEvent::ContextUpdated { worker_id: id, blob });
                    }
                    Ok(Some(ChildMessage::Error { desc })) => {
                        let _ = internal_tx.send(WorkerInternalEvent::ChildError { worker_id: id, desc });
                    }
                    Ok(Some(ChildMessage::Status { .. } | ChildMessage::Ready | ChildMessage::Result { .. })) => {
                        // Unsolicited outside of an in-flight Execute; ignore.
                    }
                    Ok(None) | Err(_) => {
                        let _ = internal_tx.send(WorkerInternalEvent::Crashed { worker_id: id });
                        return;
                    }
                }
            }
        }
    }
}

async fn drain_until_eof(channel: &mut Box<dyn WorkerChannel>) {
    loop {
        match channel.recv().await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return,
        }
    }
}

async fn execute_one(
    id: WorkerId,
    channel: &mut Box<dyn WorkerChannel>,
    item: WorkItem,
    internal_tx: &mpsc::UnboundedSender<WorkerInternalEvent>,
) -> Result<ExecutionResult, OrchestratorError> {
    let started = std::time::Instant::now();
    let deadline = item.dispatch_timeout();

    channel
        .send(ParentMessage::Execute {
            id: item.id,
            payload: item.input.clone(),
        })
        .await?;

    let wait_for_result = async {
        loop {
            match channel.recv().await? {
                Some(ChildMessage::Result { id: rid, success, result, error }) if rid == item.id => {
                    return Ok((success, result, error));
                }
                Some(ChildMessage::Log { line }) => {
                    let _ = internal_tx.send(WorkerInternalEvent::Log { worker_id: id, line });
                }
                Some(ChildMessage::Context { blob }) => {
                    let _ = internal_tx.send(WorkerInternalEvent::ContextUpdated { worker_id: id, blob });
                }
                Some(_) => continue,
                None => return Err(OrchestratorError::WorkerCrash(format!("{id} closed mid-execution"))),
            }
        }
    };

    match tokio::time::timeout(deadline, wait_for_result).await {
        Ok(Ok((success, result, error))) => {
            let duration = started.elapsed();
            Ok(if success {
                ExecutionResult::success(item.id, id, result.unwrap_or_default(), duration)
            } else {
                ExecutionResult::failure(item.id, id, error.unwrap_or_default(), duration)
            })
        }
        Ok(Err(err)) => Err(err),
        Err(_) => Err(OrchestratorError::ExecutionTimeout(deadline)),
    }
}
