use std::path::PathBuf;

use clap::Parser;
use swarmforge_core::OrchestratorError;
use swarmforge_engine::{OrchestratorConfig, config::parse_strategy};
use swarmforge_governor::RateLimitConfig;

/// Operator entry point: drives one hierarchical workflow run to completion
/// and prints the final report as JSON. Owns no orchestration logic itself —
/// it only resolves configuration and wires it into an [`swarmforge_engine::Orchestrator`].
#[derive(Debug, Parser)]
#[command(name = "swarmforge", version, about = "Massive-parallel AI-worker orchestrator")]
pub struct Cli {
    /// Path to a JSON file whose bytes seed the root PROJECT work item.
    pub seed: PathBuf,

    /// Optional TOML configuration file, applied over the built-in
    /// defaults and before the flags/environment below.
    #[arg(long, env = "SWARMFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Program to spawn for each worker instance.
    #[arg(long, env = "SWARMFORGE_WORKER_CMD", default_value = "swarmforge-worker")]
    pub worker_cmd: String,

    /// Extra arguments passed to the worker program.
    #[arg(long = "worker-arg", env = "SWARMFORGE_WORKER_ARGS", value_delimiter = ' ')]
    pub worker_args: Vec<String>,

    /// Fixed worker-pool ceiling; if omitted, computed from host resources
    /// unless `--no-auto-calculate-instances` is also given.
    #[arg(long, env = "SWARMFORGE_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Maximum sustained worker spawn rate.
    #[arg(long, env = "SWARMFORGE_INSTANCES_PER_MINUTE")]
    pub instances_per_minute: Option<u32>,

    /// Completed-task recycle threshold per worker.
    #[arg(long, env = "SWARMFORGE_TASKS_PER_WORKER")]
    pub tasks_per_worker: Option<u64>,

    /// Default per-task timeout in milliseconds, used for TASK-level items
    /// with no explicit duration estimate.
    #[arg(long, env = "SWARMFORGE_TASK_TIMEOUT_MS")]
    pub task_timeout_ms: Option<u64>,

    /// Requests-per-minute budget for the primary AI service.
    #[arg(long, env = "SWARMFORGE_API_RATE_LIMIT")]
    pub api_rate_limit: Option<u32>,

    /// Retry attempts per work item before permanent failure.
    #[arg(long, env = "SWARMFORGE_RETRY_ATTEMPTS")]
    pub retry_attempts: Option<u32>,

    /// Carry a worker's context blob forward across recycle/retry/children.
    #[arg(long, env = "SWARMFORGE_CONTEXT_PRESERVATION")]
    pub context_preservation: Option<bool>,

    /// Auto-size the pool from host resources when `--max-workers` is
    /// omitted.
    #[arg(long, env = "SWARMFORGE_AUTO_CALCULATE_INSTANCES")]
    pub auto_calculate_instances: Option<bool>,

    /// Dispatch strategy: one of round-robin, least-loaded, priority-based,
    /// context-aware, hybrid.
    #[arg(long, env = "SWARMFORGE_STRATEGY")]
    pub strategy: Option<String>,
}

impl Cli {
    /// Applies CLI/environment values over `config`, the highest-precedence
    /// layer over built-in defaults and the optional file.
    pub fn apply_overrides(&self, config: &mut OrchestratorConfig) -> Result<(), OrchestratorError> {
        if let Some(v) = self.max_workers {
            config.max_workers = Some(v);
        }
        if let Some(v) = self.instances_per_minute {
            config.instances_per_minute = v;
        }
        if let Some(v) = self.tasks_per_worker {
            config.tasks_per_worker = v;
        }
        if let Some(v) = self.task_timeout_ms {
            config.task_timeout_ms = v;
        }
        if let Some(v) = self.retry_attempts {
            config.retry_attempts = v;
        }
        if let Some(v) = self.context_preservation {
            config.context_preservation = v;
        }
        if let Some(v) = self.auto_calculate_instances {
            config.auto_calculate_instances = v;
        }
        if let Some(raw) = &self.strategy {
            config.strategy = parse_strategy(raw)?;
        }
        if let Some(limit) = self.api_rate_limit {
            let rate_limit = RateLimitConfig {
                requests_per_window: limit,
                ..RateLimitConfig::default()
            };
            config.rate_limits.insert("primary-ai".to_string(), rate_limit);
        }
        Ok(())
    }
}
