//! In-process fake [`WorkerSpawner`]/[`WorkerChannel`] pair so pool and
//! distributor scenarios can run without a real child process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use swarmforge_core::{OrchestratorError, Payload, WorkItemId};
use swarmforge_engine::{ChildMessage, ParentMessage, SpawnSpec, WorkerChannel, WorkerSpawner};

/// What a fake worker does with one execution attempt.
pub enum FakeOutcome {
    Success(Payload),
    Failure(String),
}

/// A spawner whose channels answer `Execute` with whatever `behavior`
/// returns for `(item_id, attempt_number)`. `attempt_number` starts at 1 and
/// is shared across every channel this spawner hands out, so a worker
/// recycle or a retry re-dispatched to a different worker still sees the
/// right attempt count.
pub struct FakeSpawner {
    behavior: Arc<dyn Fn(WorkItemId, u32) -> FakeOutcome + Send + Sync>,
    attempts: Arc<Mutex<HashMap<WorkItemId, u32>>>,
    delay: Duration,
}

impl FakeSpawner {
    pub fn new(behavior: impl Fn(WorkItemId, u32) -> FakeOutcome + Send + Sync + 'static) -> Self {
        Self {
            behavior: Arc::new(behavior),
            attempts: Arc::new(Mutex::new(HashMap::new())),
            delay: Duration::ZERO,
        }
    }

    pub fn always_succeed() -> Self {
        Self::new(|_, _| FakeOutcome::Success(Payload::default()))
    }

    /// Makes every channel this spawner hands out sleep `delay` before
    /// answering `Execute`, so tests can observe in-flight concurrency
    /// instead of every item resolving on the same poll.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl WorkerSpawner for FakeSpawner {
    async fn spawn(&self, _spec: &SpawnSpec) -> Result<Box<dyn WorkerChannel>, OrchestratorError> {
        Ok(Box::new(FakeChannel {
            ready_sent: false,
            pending: None,
            behavior: self.behavior.clone(),
            attempts: self.attempts.clone(),
            delay: self.delay,
        }))
    }
}

struct FakeChannel {
    ready_sent: bool,
    pending: Option<WorkItemId>,
    behavior: Arc<dyn Fn(WorkItemId, u32) -> FakeOutcome + Send + Sync>,
    attempts: Arc<Mutex<HashMap<WorkItemId, u32>>>,
    delay: Duration,
}

#[async_trait]
impl WorkerChannel for FakeChannel {
    async fn send(&mut self, message: ParentMessage) -> Result<(), OrchestratorError> {
        if let ParentMessage::Execute { id, .. } = message {
            self.pending = Some(id);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ChildMessage>, OrchestratorError> {
        if !self.ready_sent {
            self.ready_sent = true;
            return Ok(Some(ChildMessage::Ready));
        }

        if let Some(id) = self.pending.take() {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let attempt = {
                let mut attempts = self.attempts.lock().expect("fake spawner mutex poisoned");
                let counter = attempts.entry(id).or_insert(0);
                *counter += 1;
                *counter
            };
            return Ok(Some(match (self.behavior)(id, attempt) {
                FakeOutcome::Success(data) => ChildMessage::Result {
                    id,
                    success: true,
                    result: Some(data),
                    error: None,
                },
                FakeOutcome::Failure(err) => ChildMessage::Result {
                    id,
                    success: false,
                    result: None,
                    error: Some(err),
                },
            }));
        }

        // No command in flight: behave like a child idling on its stdin read.
        std::future::pending().await
    }

    async fn kill(&mut self) {}
}
