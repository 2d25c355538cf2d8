//! Host-resource–aware sizing of the worker pool (spec component C1).
//!
//! Measures total/free RAM, available storage and CPU core count, then
//! derives the maximum number of workers the host can concurrently run
//! without starving itself. On measurement failure it falls back to a
//! conservative default rather than failing the caller.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::warn;

/// Tunables for [`ResourceSizer::compute_capacity`]. Defaults match the
/// reference model: 512MB RAM and 50MB storage per worker, a CPU weight of
/// 0.25, a 15% safety margin and a [1, 50] worker-count clamp.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSizerConfig {
    pub ram_per_worker_mb: u64,
    pub storage_per_worker_mb: u64,
    pub cpu_weight: f64,
    pub safety_margin: f64,
    pub min_workers: usize,
    pub max_workers_cap: usize,
    pub fallback_workers: usize,
}

impl Default for ResourceSizerConfig {
    fn default() -> Self {
        Self {
            ram_per_worker_mb: 512,
            storage_per_worker_mb: 50,
            cpu_weight: 0.25,
            safety_margin: 0.85,
            min_workers: 1,
            max_workers_cap: 50,
            fallback_workers: 5,
        }
    }
}

/// Which resource is the binding constraint on worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bottleneck {
    Ram,
    Storage,
    Cpu,
}

impl std::fmt::Display for Bottleneck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bottleneck::Ram => write!(f, "ram"),
            Bottleneck::Storage => write!(f, "storage"),
            Bottleneck::Cpu => write!(f, "cpu"),
        }
    }
}

/// Raw host measurement this sizing was derived from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub total_ram_mb: u64,
    pub free_ram_mb: u64,
    pub available_storage_mb: u64,
    pub cores: usize,
}

/// Result of [`ResourceSizer::compute_capacity`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capacity {
    pub max_workers: usize,
    pub bottleneck: Bottleneck,
    pub rationale: String,
    pub snapshot: HostSnapshot,
}

/// Result of [`ResourceSizer::current_utilization`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Utilization {
    pub ram_frac: f64,
    pub storage_frac: f64,
    pub cpu_load_frac: f64,
}

/// Result of [`ResourceSizer::suggest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub should_adjust: bool,
    pub suggested: usize,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
enum MeasurementError {
    #[error("host reported zero total RAM")]
    NoRam,
    #[error("no storage volumes detected")]
    NoStorage,
    #[error("host reported zero CPU cores")]
    NoCores,
}

/// Measures host resources and sizes the worker pool accordingly.
pub struct ResourceSizer {
    config: ResourceSizerConfig,
    system: Mutex<System>,
}

impl ResourceSizer {
    pub fn new(config: ResourceSizerConfig) -> Self {
        Self {
            config,
            system: Mutex::new(System::new()),
        }
    }

    fn measure(&self) -> Result<HostSnapshot, MeasurementError> {
        let mut system = self.system.lock().expect("resource sizer mutex poisoned");
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total_ram_mb = system.total_memory() / (1024 * 1024);
        if total_ram_mb == 0 {
            return Err(MeasurementError::NoRam);
        }
        let free_ram_mb = system.available_memory() / (1024 * 1024);

        let cores = system.physical_core_count().unwrap_or(0);
        if cores == 0 {
            return Err(MeasurementError::NoCores);
        }

        let disks = Disks::new_with_refreshed_list();
        if disks.is_empty() {
            return Err(MeasurementError::NoStorage);
        }
        let available_storage_mb: u64 = disks
            .iter()
            .map(|d| d.available_space() / (1024 * 1024))
            .sum();

        Ok(HostSnapshot {
            total_ram_mb,
            free_ram_mb,
            available_storage_mb,
            cores,
        })
    }

    fn fallback_capacity(&self, reason: &str) -> Capacity {
        Capacity {
            max_workers: self.config.fallback_workers,
            bottleneck: Bottleneck::Ram,
            rationale: format!("fallback: {reason}"),
            snapshot: HostSnapshot {
                total_ram_mb: 0,
                free_ram_mb: 0,
                available_storage_mb: 0,
                cores: 0,
            },
        }
    }

    /// `ComputeCapacity` — derives `maxWorkers` and the binding bottleneck
    /// from a fresh host measurement.
    pub fn compute_capacity(&self) -> Capacity {
        let snapshot = match self.measure() {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, "resource measurement failed, using fallback capacity");
                return self.fallback_capacity(&err.to_string());
            }
        };

        let ram_cap =
            ((snapshot.total_ram_mb as f64 * 0.50) / self.config.ram_per_worker_mb as f64).floor();
        let storage_cap = ((snapshot.available_storage_mb as f64 * 0.10)
            / self.config.storage_per_worker_mb as f64)
            .floor();
        let cpu_cap = ((snapshot.cores.max(1).saturating_sub(1).max(1) as f64 * 0.80)
            / self.config.cpu_weight)
            .floor();

        let candidates = [
            (Bottleneck::Ram, ram_cap),
            (Bottleneck::Storage, storage_cap),
            (Bottleneck::Cpu, cpu_cap),
        ];

        let (bottleneck, raw_min) = candidates
            .into_iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .expect("candidates is non-empty");

        let with_margin = (raw_min * self.config.safety_margin).floor();
        let max_workers = (with_margin as i64)
            .clamp(self.config.min_workers as i64, self.config.max_workers_cap as i64)
            as usize;

        let rationale = format!(
            "bottleneck={bottleneck} ram_cap={ram_cap:.0} storage_cap={storage_cap:.0} cpu_cap={cpu_cap:.0} margin={:.2} -> {max_workers}",
            self.config.safety_margin
        );

        Capacity {
            max_workers,
            bottleneck,
            rationale,
            snapshot,
        }
    }

    /// `CurrentUtilization` — fraction of RAM/storage/CPU currently in use.
    pub fn current_utilization(&self) -> Utilization {
        let snapshot = match self.measure() {
            Ok(s) => s,
            Err(_) => {
                return Utilization {
                    ram_frac: 0.0,
                    storage_frac: 0.0,
                    cpu_load_frac: 0.0,
                };
            }
        };

        let ram_frac = if snapshot.total_ram_mb == 0 {
            0.0
        } else {
            1.0 - (snapshot.free_ram_mb as f64 / snapshot.total_ram_mb as f64)
        };

        let cpu_load_frac = {
            let system = self.system.lock().expect("resource sizer mutex poisoned");
            let usages: Vec<f32> = system.cpus().iter().map(|c| c.cpu_usage()).collect();
            if usages.is_empty() {
                0.0
            } else {
                (usages.iter().copied().sum::<f32>() / usages.len() as f32 / 100.0) as f64
            }
        };

        Utilization {
            ram_frac,
            // Storage utilization is not part of the sizing model beyond
            // availability; report it as the complement of free space
            // relative to itself (always 0 without a historical baseline).
            storage_frac: 0.0,
            cpu_load_frac,
        }
    }

    /// `Suggest` — recommends growing or shrinking the pool based on
    /// current RAM pressure.
    pub fn suggest(&self, current_count: usize) -> Suggestion {
        let capacity = self.compute_capacity();
        let utilization = self.current_utilization();

        if utilization.ram_frac > 0.80 && current_count >= capacity.max_workers {
            let suggested = ((current_count as f64) * 0.80).floor() as usize;
            return Suggestion {
                should_adjust: true,
                suggested: suggested.max(self.config.min_workers),
                reason: format!(
                    "ram utilization {:.0}% exceeds 80% at current capacity; shrinking",
                    utilization.ram_frac * 100.0
                ),
            };
        }

        if utilization.ram_frac < 0.50 && current_count < capacity.max_workers {
            let suggested = (current_count + 2).min(capacity.max_workers);
            return Suggestion {
                should_adjust: true,
                suggested,
                reason: format!(
                    "ram utilization {:.0}% is below 50% and pool has headroom; growing",
                    utilization.ram_frac * 100.0
                ),
            };
        }

        Suggestion {
            should_adjust: false,
            suggested: current_count,
            reason: "utilization within the stable band".to_string(),
        }
    }
}

impl Default for ResourceSizer {
    fn default() -> Self {
        Self::new(ResourceSizerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_capacity_uses_configured_default() {
        let sizer = ResourceSizer::new(ResourceSizerConfig {
            fallback_workers: 7,
            ..ResourceSizerConfig::default()
        });
        let capacity = sizer.fallback_capacity("simulated failure");
        assert_eq!(capacity.max_workers, 7);
        assert!(capacity.rationale.starts_with("fallback:"));
    }

    #[test]
    fn compute_capacity_clamps_into_one_to_fifty() {
        let sizer = ResourceSizer::default();
        let capacity = sizer.compute_capacity();
        assert!(capacity.max_workers >= 1);
        assert!(capacity.max_workers <= 50);
    }

    #[test]
    fn suggest_never_recommends_below_min_workers() {
        let sizer = ResourceSizer::default();
        let suggestion = sizer.suggest(0);
        assert!(suggestion.suggested >= sizer.config.min_workers);
    }
}
