//! Engine configuration.
//!
//! All tuning knobs live here with serde defaults so a bare `Config::default()`
//! is a working deployment and a TOML file only needs to override what it
//! cares about. Tolerances and thresholds (self-match tolerance, recall
//! threshold, latency ceilings) are deliberately configuration, not constants.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CumulusError, Result};
use crate::types::{Horizon, Strategy};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Root of the managed on-disk layout (live/, staging/, backups/, locks/).
    pub data_root: PathBuf,
    /// Root of the read-only vector store (one subdirectory per horizon).
    pub store_root: PathBuf,
    /// Horizons served by this deployment, in hours.
    pub horizons: Vec<u16>,
    pub build: BuildConfig,
    pub validation: ValidationConfig,
    pub backup: BackupConfig,
    pub scheduler: SchedulerConfig,
    pub ensemble: EnsembleConfig,
    pub health: HealthConfig,
    pub approximate: ApproximateParams,
}

impl Config {
    /// Load configuration from a TOML file, or fall back to defaults when
    /// `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw).map_err(|e| CumulusError::Config(e.to_string()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn horizons(&self) -> Vec<Horizon> {
        self.horizons.iter().copied().map(Horizon).collect()
    }
}

/// Index build pipeline knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Strategies built for every horizon.
    pub strategies: Vec<Strategy>,
    /// Wall-clock ceiling for one horizon's build (all strategies).
    pub timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            strategies: vec![Strategy::Exact, Strategy::Approximate],
            timeout_secs: 600,
        }
    }
}

impl BuildConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Validation gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Number of sampled self-similarity queries in the functional check.
    pub functional_samples: usize,
    /// A self-match must score at least `1.0 - self_match_tolerance`.
    pub self_match_tolerance: f32,
    /// Query count for the latency measurement.
    pub latency_samples: usize,
    /// p95 ceiling for validation queries, in milliseconds.
    pub latency_ceiling_ms: f64,
    /// Minimum top-k overlap with the exact baseline (approximate only).
    pub recall_threshold: f64,
    /// Sampled queries used for the recall estimate.
    pub recall_samples: usize,
    /// k used for the recall overlap.
    pub recall_k: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            functional_samples: 20,
            self_match_tolerance: 1e-3,
            latency_samples: 50,
            latency_ceiling_ms: 50.0,
            recall_threshold: 0.95,
            recall_samples: 20,
            recall_k: 10,
        }
    }
}

/// Backup retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Maximum retained backups per (horizon, strategy).
    pub max_count: usize,
    /// Maximum backup age in days.
    pub max_age_days: i64,
    /// Gzip backup payloads.
    pub compress: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_count: 5,
            max_age_days: 30,
            compress: false,
        }
    }
}

/// Rebuild trigger policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between scheduled rebuild sweeps.
    pub interval_secs: u64,
    /// Consecutive pipeline failures before entering cooldown.
    pub max_consecutive_failures: u32,
    /// Cooldown length after repeated failures.
    pub cooldown_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 24 * 60 * 60,
            max_consecutive_failures: 3,
            cooldown_secs: 60 * 60,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Ensemble aggregation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Softmax temperature over similarity scores.
    pub temperature: f32,
    /// Default neighbor count when the caller does not specify k.
    pub default_k: usize,
    /// k ceiling applied when the horizon is degraded.
    pub degraded_top_k: usize,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            default_k: 20,
            degraded_top_k: 5,
        }
    }
}

/// Health classification thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Rolling window length, in query outcomes, per horizon.
    pub window_size: usize,
    /// Error rate that flips healthy -> degraded.
    pub warning_error_rate: f64,
    /// Error rate that flips degraded -> unhealthy.
    pub critical_error_rate: f64,
    /// Latency p95 ceiling (ms) that also flips healthy -> degraded.
    pub latency_ceiling_ms: f64,
    /// Consecutive successes required before severity may step down.
    pub recovery_successes: usize,
    /// Outcomes required before classification kicks in at all.
    pub min_samples: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            warning_error_rate: 0.1,
            critical_error_rate: 0.5,
            latency_ceiling_ms: 250.0,
            recovery_successes: 10,
            min_samples: 5,
        }
    }
}

/// Tuning for the approximate (IVF-style quantized) strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproximateParams {
    /// Number of coarse clusters. Clamped to the vector count at build time.
    pub num_clusters: usize,
    /// Clusters probed per query.
    pub nprobe: usize,
    /// k-means refinement iterations.
    pub kmeans_iterations: usize,
}

impl Default for ApproximateParams {
    fn default() -> Self {
        Self {
            num_clusters: 64,
            nprobe: 8,
            kmeans_iterations: 10,
        }
    }
}
