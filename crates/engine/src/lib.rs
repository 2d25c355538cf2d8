//! `swarmforge-engine`: the orchestration core (spec components C1-C6)
//! wired into a single handle.
//!
//! Each component owns its own slice of mutable state (the pool owns
//! workers, the governor owns quotas, the distributor owns the pending
//! queue) and the event bus is the only back-channel between them — no
//! component holds a reference back to one that depends on it.

pub mod config;
pub mod context_store;
pub mod distributor;
pub mod pool;
pub mod workflow;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use swarmforge_core::{Event, EventBus, OrchestratorError, Payload};
use swarmforge_governor::RateGovernor;
use swarmforge_resource::{ResourceSizer, ResourceSizerConfig, Suggestion};
use tokio::sync::broadcast;
use tracing::info;

pub use config::OrchestratorConfig;
pub use context_store::ContextStore;
pub use distributor::{Distributor, DistributorConfig, DistributorStatus, Metrics, Strategy};
pub use pool::{
    ChildMessage, ParentMessage, PoolConfig, PoolStats, ProcessSpawner, SpawnSpec, WorkerChannel,
    WorkerPool, WorkerSpawner,
};
pub use workflow::{LevelReport, Report, WorkflowDriver};

/// One fully-wired orchestrator instance: resource sizer, rate governor,
/// worker pool, distributor and workflow driver, sharing one event bus.
pub struct Orchestrator {
    events: Arc<EventBus>,
    pool: Arc<WorkerPool>,
    governor: Arc<RateGovernor>,
    distributor: Arc<Distributor>,
    driver: Arc<WorkflowDriver>,
    resource_sizer: Arc<ResourceSizer>,
}

impl Orchestrator {
    /// Builds an orchestrator from a resolved configuration and a worker
    /// spawner (production code passes a [`ProcessSpawner`]; tests pass an
    /// in-process fake).
    pub async fn new(
        config: OrchestratorConfig,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Result<Self, OrchestratorError> {
        let events = Arc::new(EventBus::default());
        let resource_sizer = Arc::new(ResourceSizer::new(ResourceSizerConfig::default()));

        let max_workers = match config.max_workers {
            Some(n) => n,
            None if config.auto_calculate_instances => {
                let capacity = resource_sizer.compute_capacity();
                events.publish(Event::ResourceCalculated {
                    max_workers: capacity.max_workers,
                    bottleneck: capacity.bottleneck.to_string(),
                    rationale: capacity.rationale.clone(),
                });
                capacity.max_workers
            }
            None => PoolConfig::default().max_workers,
        };

        let pool_config = PoolConfig {
            max_workers,
            recycle_threshold: config.tasks_per_worker,
            preserve_context: config.context_preservation,
            ..PoolConfig::default()
        };
        let pool = Arc::new(WorkerPool::new(pool_config, spawner, events.clone()));

        let governor = Arc::new(RateGovernor::new(events.clone()));
        for (service, limit) in &config.rate_limits {
            governor.configure(service, limit.clone()).await?;
        }

        let context_store = Arc::new(ContextStore::new());
        let distributor_config = DistributorConfig {
            strategy: config.strategy,
            max_retries: config.retry_attempts,
            ..DistributorConfig::default()
        };
        let distributor = Arc::new(Distributor::new(
            distributor_config,
            pool.clone(),
            governor.clone(),
            context_store,
            events.clone(),
        ));

        let driver = Arc::new(WorkflowDriver::new(
            distributor.clone(),
            pool.clone(),
            events.clone(),
            config.context_preservation,
            config.retry_attempts,
            Some(Duration::from_millis(config.task_timeout_ms)),
        ));

        info!(max_workers, strategy = ?config.strategy, "orchestrator initialized");
        events.publish(Event::Initialized);

        Ok(Self {
            events,
            pool,
            governor,
            distributor,
            driver,
            resource_sizer,
        })
    }

    /// Subscribe to the lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Point-in-time worker pool occupancy.
    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Runs one five-level hierarchical expansion seeded with `seed` to
    /// completion and returns the aggregate report.
    pub async fn run(&self, seed: Payload) -> Result<Report, OrchestratorError> {
        self.distributor.start();
        let report = self.driver.run_hierarchy(seed).await;
        self.distributor.stop().await;
        report
    }

    /// `Stop` — halts dispatch; already-executing items run to completion.
    pub async fn request_stop(&self) {
        self.distributor.stop().await;
    }

    /// Tears down every worker. Called automatically on an unrecoverable
    /// workflow error; exposed for an operator-triggered full shutdown too.
    pub async fn terminate_all(&self) {
        self.pool.terminate_all().await;
    }

    /// `EmergencyStop` on the rate governor — halts all service
    /// acquisitions until [`Orchestrator::resume`].
    pub fn emergency_stop(&self) {
        self.governor.emergency_stop();
    }

    pub fn resume(&self) {
        self.governor.resume();
    }

    /// Resource-sizer `Suggest` — recommends growing or shrinking the pool
    /// based on current RAM pressure. Advisory only; does not touch the
    /// pool. See [`Orchestrator::recalculate`] to apply it.
    pub fn suggest_resize(&self, current_count: usize) -> Suggestion {
        self.resource_sizer.suggest(current_count)
    }

    /// `Recalculate` — computes a fresh [`Suggestion`] from current host
    /// utilization and applies it to the worker pool: a shrink lowers
    /// `max_workers` and terminates idle workers down to it (never
    /// interrupting a busy one); a grow only raises the ceiling, since new
    /// workers spawn lazily on the next `Acquire`.
    pub async fn recalculate(&self, current_count: usize) -> Suggestion {
        let suggestion = self.resource_sizer.suggest(current_count);
        if suggestion.should_adjust {
            self.pool.recalculate(&suggestion).await;
        }
        suggestion
    }

    pub async fn distributor_metrics(&self) -> Metrics {
        self.distributor.metrics().await
    }

    pub async fn distributor_status(&self) -> DistributorStatus {
        self.distributor.status().await
    }

    /// Service → quota snapshot for every configured rate limiter.
    pub async fn quota_snapshots(
        &self,
        services: &[String],
    ) -> HashMap<String, swarmforge_governor::QuotaSnapshot> {
        let mut snapshots = HashMap::new();
        for service in services {
            if let Ok(snapshot) = self.governor.status(service).await {
                snapshots.insert(service.clone(), snapshot);
            }
        }
        snapshots
    }
}
