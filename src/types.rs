use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier tying an embedding to its recorded outcome.
pub type SampleId = String;

/// A forecast lead time in hours. Each horizon owns an independent
/// vector store and index set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Horizon(pub u16);

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}h", self.0)
    }
}

/// Index strategy: exact brute-force search or quantized approximate search.
///
/// Closed enum so strategy dispatch is a match, not runtime type inspection.
/// Approximate tuning parameters live in `ApproximateParams` (config) so the
/// variant stays `Copy` and usable as a registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Exact,
    Approximate,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Exact => "exact",
            Strategy::Approximate => "approximate",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An embedding of an atmospheric state, produced externally. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub sample_id: SampleId,
    pub vector: Vec<f32>,
    pub timestamp: DateTime<Utc>,
}

/// The observed weather variables recorded for a sample, in fixed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub sample_id: SampleId,
    pub values: Vec<f32>,
    pub timestamp: DateTime<Utc>,
}

/// One immutable, versioned build of a similarity index for a
/// (horizon, strategy) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexGeneration {
    pub id: Ulid,
    pub horizon: Horizon,
    pub strategy: Strategy,
    pub vector_count: usize,
    pub dimension: usize,
    pub build_timestamp: DateTime<Utc>,
    /// xxh3 hash of the source embedding bytes, for drift detection.
    pub content_hash: u64,
}

/// A generation sitting in the staging area, not yet validated or deployed.
#[derive(Debug, Clone)]
pub struct StagedGeneration {
    pub generation: IndexGeneration,
    /// Staging directory holding `index.bin` and `generation.json`.
    pub dir: PathBuf,
}

/// Result of a single validation check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// Outcome of validating a staged generation. Immutable once produced;
/// the deployer refuses any report with `passed == false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub generation_id: Ulid,
    pub passed: bool,
    pub checks: Vec<CheckResult>,
    pub recall_estimate: Option<f64>,
    pub latency_p95_ms: f64,
}

impl ValidationReport {
    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// A retained copy of a previously live generation, kept for rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub generation: IndexGeneration,
    pub stored_at: DateTime<Utc>,
    pub compressed: bool,
    pub retention_expires_at: DateTime<Utc>,
    /// Backup directory holding the index payload and `snapshot.json`.
    pub dir: PathBuf,
}

/// Why a retrieval declined (or failed to use) the primary path.
///
/// `IndexUnavailable` and `DimensionMismatch` are recorded by the retrieval
/// path in this crate. `Timeout` and `MemoryPressure` are reserved for the
/// serving layer that wraps it: retrieval here is synchronous with no
/// deadline, and admission control lives above the engine. They stay in the
/// enum so the counter labels and wire format do not change when that layer
/// records them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    IndexUnavailable,
    Timeout,
    DimensionMismatch,
    MemoryPressure,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::IndexUnavailable => "index_unavailable",
            FallbackReason::Timeout => "timeout",
            FallbackReason::DimensionMismatch => "dimension_mismatch",
            FallbackReason::MemoryPressure => "memory_pressure",
        }
    }

    pub const ALL: [FallbackReason; 4] = [
        FallbackReason::IndexUnavailable,
        FallbackReason::Timeout,
        FallbackReason::DimensionMismatch,
        FallbackReason::MemoryPressure,
    ];
}

/// The terminal record of one tracked retrieval, consumed by the health
/// monitor and then discarded.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub horizon: Horizon,
    pub success: bool,
    pub latency: std::time::Duration,
    pub neighbor_count: usize,
    pub fallback_reason: Option<FallbackReason>,
}

/// Health classification for one horizon's serving path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time health snapshot for one horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HorizonHealthState {
    pub status: HealthStatus,
    pub error_rate: f64,
    pub latency_p95_ms: f64,
    pub window_len: usize,
    pub last_success_time: Option<DateTime<Utc>>,
    pub degraded_since: Option<DateTime<Utc>>,
    pub fallback_counters: HashMap<String, u64>,
}

/// A single analog neighbor returned by index search.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub sample_id: SampleId,
    pub similarity: f32,
}

/// Per-variable quantiles of the ensemble, in the outcome variable order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastQuantiles {
    pub p10: Vec<f32>,
    pub p50: Vec<f32>,
    pub p90: Vec<f32>,
}

/// A probabilistic forecast assembled from analog outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forecast {
    pub horizon: Horizon,
    pub strategy_used: Strategy,
    pub neighbor_count: usize,
    /// Weighted ensemble mean per outcome variable.
    pub mean: Vec<f32>,
    pub quantiles: ForecastQuantiles,
    /// Confidence in [0, 1] derived from similarity level and spread.
    pub confidence: f32,
    /// Set when the health monitor forced a degraded query path.
    pub degraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_horizon_display() {
        assert_eq!(Horizon(6).to_string(), "6h");
        assert_eq!(Horizon(24).to_string(), "24h");
    }

    #[test]
    fn test_strategy_labels() {
        assert_eq!(Strategy::Exact.as_str(), "exact");
        assert_eq!(Strategy::Approximate.as_str(), "approximate");
    }

    #[test]
    fn test_fallback_reason_labels_are_stable() {
        let labels: Vec<&str> = FallbackReason::ALL.iter().map(|r| r.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "index_unavailable",
                "timeout",
                "dimension_mismatch",
                "memory_pressure"
            ]
        );
    }

    #[test]
    fn test_validation_report_failed_checks() {
        let report = ValidationReport {
            generation_id: Ulid::new(),
            passed: false,
            checks: vec![
                CheckResult {
                    name: "structural".into(),
                    passed: true,
                    detail: "ok".into(),
                },
                CheckResult {
                    name: "functional".into(),
                    passed: false,
                    detail: "self-match below tolerance".into(),
                },
            ],
            recall_estimate: None,
            latency_p95_ms: 1.2,
        };
        let failed: Vec<&str> = report.failed_checks().map(|c| c.name.as_str()).collect();
        assert_eq!(failed, vec!["functional"]);
    }
}
