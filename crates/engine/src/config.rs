//! Layered orchestrator configuration: built-in defaults, an optional TOML
//! file, then CLI flags/environment — in that precedence order, highest
//! last. The CLI crate owns the flag/env layer; this module owns the first
//! two and the merge.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use swarmforge_core::OrchestratorError;
use swarmforge_governor::RateLimitConfig;

use crate::distributor::Strategy;

/// Fully-resolved configuration for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_workers: Option<usize>,
    pub instances_per_minute: u32,
    pub tasks_per_worker: u64,
    pub task_timeout_ms: u64,
    pub retry_attempts: u32,
    pub context_preservation: bool,
    pub auto_calculate_instances: bool,
    pub strategy: Strategy,
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            instances_per_minute: 30,
            tasks_per_worker: 50,
            task_timeout_ms: 60_000,
            retry_attempts: 3,
            context_preservation: true,
            auto_calculate_instances: true,
            strategy: Strategy::default(),
            rate_limits: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Applies an optional TOML file on top of the built-in defaults. A
    /// missing file is not an error — it simply means this layer is a
    /// no-op, matching this stack's convention for optional config files.
    pub fn merge_file(mut self, path: &Path) -> Result<Self, OrchestratorError> {
        if !path.exists() {
            return Ok(self);
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|err| OrchestratorError::ConfigError(format!("reading {path:?}: {err}")))?;
        let file: OrchestratorConfigFile = toml::from_str(&raw)
            .map_err(|err| OrchestratorError::ConfigError(format!("parsing {path:?}: {err}")))?;

        if let Some(v) = file.max_workers {
            self.max_workers = Some(v);
        }
        if let Some(v) = file.instances_per_minute {
            self.instances_per_minute = v;
        }
        if let Some(v) = file.tasks_per_worker {
            self.tasks_per_worker = v;
        }
        if let Some(v) = file.task_timeout_ms {
            self.task_timeout_ms = v;
        }
        if let Some(v) = file.retry_attempts {
            self.retry_attempts = v;
        }
        if let Some(v) = file.context_preservation {
            self.context_preservation = v;
        }
        if let Some(v) = file.auto_calculate_instances {
            self.auto_calculate_instances = v;
        }
        if let Some(raw_strategy) = file.strategy {
            self.strategy = parse_strategy(&raw_strategy)?;
        }
        for (service, limit) in file.rate_limits {
            self.rate_limits.insert(service, limit.into_rate_limit_config()?);
        }

        Ok(self)
    }
}

/// Parses the five spec-named strategy strings (kebab-case, as documented
/// in the orchestrator configuration surface).
pub fn parse_strategy(raw: &str) -> Result<Strategy, OrchestratorError> {
    match raw {
        "round-robin" => Ok(Strategy::RoundRobin),
        "least-loaded" => Ok(Strategy::LeastLoaded),
        "priority-based" => Ok(Strategy::PriorityBased),
        "context-aware" => Ok(Strategy::ContextAware),
        "hybrid" => Ok(Strategy::Hybrid),
        other => Err(OrchestratorError::ConfigError(format!("unknown strategy {other:?}"))),
    }
}

/// Mirror of [`OrchestratorConfig`] for TOML deserialization; every field is
/// optional so a partial file only overrides what it names.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrchestratorConfigFile {
    max_workers: Option<usize>,
    instances_per_minute: Option<u32>,
    tasks_per_worker: Option<u64>,
    task_timeout_ms: Option<u64>,
    retry_attempts: Option<u32>,
    context_preservation: Option<bool>,
    auto_calculate_instances: Option<bool>,
    strategy: Option<String>,
    #[serde(default)]
    rate_limits: HashMap<String, RateLimitConfigFile>,
}

/// Mirror of [`RateLimitConfig`] for TOML deserialization, keyed by service
/// name at the call site.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitConfigFile {
    requests_per_window: Option<u32>,
    window_ms: Option<u64>,
    tokens_per_window: Option<u64>,
    tokens_per_day: Option<u64>,
    max_concurrent: Option<u32>,
    burst_allowance: Option<f64>,
    reserve_fraction: Option<f64>,
    backoff_multiplier: Option<f64>,
    backoff_cap_ms: Option<u64>,
}

impl RateLimitConfigFile {
    fn into_rate_limit_config(self) -> Result<RateLimitConfig, OrchestratorError> {
        let defaults = RateLimitConfig::default();
        Ok(RateLimitConfig {
            requests_per_window: self.requests_per_window.unwrap_or(defaults.requests_per_window),
            window: self.window_ms.map(Duration::from_millis).unwrap_or(defaults.window),
            tokens_per_window: self.tokens_per_window.or(defaults.tokens_per_window),
            tokens_per_day: self.tokens_per_day.or(defaults.tokens_per_day),
            max_concurrent: self.max_concurrent.unwrap_or(defaults.max_concurrent),
            burst_allowance: self.burst_allowance.unwrap_or(defaults.burst_allowance),
            reserve_fraction: self.reserve_fraction.unwrap_or(defaults.reserve_fraction),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
            backoff_cap: self
                .backoff_cap_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_cap),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_leaves_defaults_untouched() {
        let config = OrchestratorConfig::default()
            .merge_file(Path::new("/nonexistent/swarmforge.toml"))
            .unwrap();
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.max_workers, None);
    }

    #[test]
    fn parse_strategy_accepts_all_five_names() {
        for name in ["round-robin", "least-loaded", "priority-based", "context-aware", "hybrid"] {
            assert!(parse_strategy(name).is_ok(), "{name} should parse");
        }
        assert!(parse_strategy("made-up").is_err());
    }

    #[test]
    fn merge_file_overrides_only_named_fields() {
        let dir = std::env::temp_dir().join(format!(
            "swarmforge-config-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("swarmforge.toml");
        std::fs::write(&path, "retryAttempts = 5\nstrategy = \"round-robin\"\n").unwrap();

        let config = OrchestratorConfig::default().merge_file(&path).unwrap();
        assert_eq!(config.retry_attempts, 5);
        assert_eq!(config.strategy, Strategy::RoundRobin);
        assert_eq!(config.tasks_per_worker, 50);

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_dir(&dir);
    }
}
