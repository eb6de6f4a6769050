//! Validation gates for staged generations.
//!
//! Checks run in order: structural, functional (self-similarity),
//! performance (p95 latency), and recall against the exact baseline for
//! approximate indices. Any failure marks the report `passed = false`; the
//! deployer refuses such reports. Validation reads only the staging area
//! and the vector store, never the live path.

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, instrument};

use crate::config::ValidationConfig;
use crate::error::StoreError;
use crate::index::{IndexFile, SimilarityIndex};
use crate::lifecycle::layout::INDEX_FILE;
use crate::store::{HorizonData, VectorStore};
use crate::types::{CheckResult, StagedGeneration, Strategy, ValidationReport};

pub struct IndexValidator {
    store: VectorStore,
    cfg: ValidationConfig,
}

impl IndexValidator {
    pub fn new(store: VectorStore, cfg: ValidationConfig) -> Self {
        Self { store, cfg }
    }

    /// Validate a staged generation.
    ///
    /// `baseline` is the exact-strategy index over the same store snapshot;
    /// required for the recall check, ignored for exact generations. Only a
    /// store read failure is an `Err`; a broken index is a failed report.
    #[instrument(skip(self, staged, baseline), fields(generation = %staged.generation.id))]
    pub fn validate(
        &self,
        staged: &StagedGeneration,
        baseline: Option<&dyn SimilarityIndex>,
    ) -> Result<ValidationReport, StoreError> {
        let data = self.store.load(staged.generation.horizon)?;
        let mut checks: Vec<CheckResult> = Vec::new();
        let mut recall_estimate = None;
        let mut latency_p95_ms = 0.0;

        // Structural: the artifact must load and agree with the store exactly.
        let index = match self.structural_check(staged, &data, &mut checks) {
            Some(index) => index,
            None => {
                return Ok(self.finish(staged, checks, recall_estimate, latency_p95_ms));
            }
        };

        self.functional_check(index.as_ref(), &data, &mut checks);
        latency_p95_ms = self.performance_check(index.as_ref(), &data, &mut checks);

        if staged.generation.strategy == Strategy::Approximate {
            recall_estimate = Some(self.recall_check(index.as_ref(), baseline, &data, &mut checks));
        }

        Ok(self.finish(staged, checks, recall_estimate, latency_p95_ms))
    }

    fn finish(
        &self,
        staged: &StagedGeneration,
        checks: Vec<CheckResult>,
        recall_estimate: Option<f64>,
        latency_p95_ms: f64,
    ) -> ValidationReport {
        let passed = checks.iter().all(|c| c.passed);
        info!(passed, checks = checks.len(), "validation complete");
        ValidationReport {
            generation_id: staged.generation.id,
            passed,
            checks,
            recall_estimate,
            latency_p95_ms,
        }
    }

    fn structural_check(
        &self,
        staged: &StagedGeneration,
        data: &HorizonData,
        checks: &mut Vec<CheckResult>,
    ) -> Option<Arc<dyn SimilarityIndex>> {
        let path = staged.dir.join(INDEX_FILE);
        let artifact = match IndexFile::read(&path) {
            Ok(a) => a,
            Err(e) => {
                checks.push(CheckResult {
                    name: "structural".into(),
                    passed: false,
                    detail: format!("unreadable index artifact at {}: {e}", path.display()),
                });
                return None;
            }
        };

        let index = artifact.payload.into_index();
        let mut problems = Vec::new();
        if index.vector_count() != data.embeddings.len() {
            problems.push(format!(
                "vector count {} != store count {}",
                index.vector_count(),
                data.embeddings.len()
            ));
        }
        if index.dimension() != data.dimension {
            problems.push(format!(
                "dimension {} != store dimension {}",
                index.dimension(),
                data.dimension
            ));
        }
        if artifact.generation.content_hash != data.content_hash {
            problems.push(format!(
                "content hash {} != current store hash {} (store drifted mid-pipeline)",
                artifact.generation.content_hash, data.content_hash
            ));
        }

        let passed = problems.is_empty();
        checks.push(CheckResult {
            name: "structural".into(),
            passed,
            detail: if passed {
                format!(
                    "{} vectors, dimension {}",
                    index.vector_count(),
                    index.dimension()
                )
            } else {
                problems.join("; ")
            },
        });
        passed.then_some(index)
    }

    /// Sampled embeddings must retrieve themselves as top-1 at similarity
    /// within tolerance of 1.0.
    fn functional_check(
        &self,
        index: &dyn SimilarityIndex,
        data: &HorizonData,
        checks: &mut Vec<CheckResult>,
    ) {
        let floor = 1.0 - self.cfg.self_match_tolerance;
        let mut failures = Vec::new();
        for e in sample(data, self.cfg.functional_samples) {
            match index.search(&e.vector, 1) {
                Ok(hits) => match hits.first() {
                    Some(top) if top.sample_id == e.sample_id && top.similarity >= floor => {}
                    Some(top) => failures.push(format!(
                        "{}: top-1 was {} at {:.4}",
                        e.sample_id, top.sample_id, top.similarity
                    )),
                    None => failures.push(format!("{}: no results", e.sample_id)),
                },
                Err(err) => failures.push(format!("{}: {err}", e.sample_id)),
            }
        }
        checks.push(CheckResult {
            name: "functional".into(),
            passed: failures.is_empty(),
            detail: if failures.is_empty() {
                format!("{} self-matches ok", self.cfg.functional_samples)
            } else {
                failures.join("; ")
            },
        });
    }

    /// p95 over a fixed sampled query set against the configured ceiling.
    fn performance_check(
        &self,
        index: &dyn SimilarityIndex,
        data: &HorizonData,
        checks: &mut Vec<CheckResult>,
    ) -> f64 {
        let mut latencies_ms: Vec<f64> = Vec::new();
        for e in sample(data, self.cfg.latency_samples) {
            let started = Instant::now();
            let _ = index.search(&e.vector, 10);
            latencies_ms.push(started.elapsed().as_secs_f64() * 1000.0);
        }
        latencies_ms.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p95 = percentile(&latencies_ms, 0.95);

        let passed = p95 <= self.cfg.latency_ceiling_ms;
        checks.push(CheckResult {
            name: "performance".into(),
            passed,
            detail: format!(
                "p95 {:.3}ms vs ceiling {:.1}ms",
                p95, self.cfg.latency_ceiling_ms
            ),
        });
        p95
    }

    /// Top-k overlap of the approximate index against the exact baseline.
    fn recall_check(
        &self,
        index: &dyn SimilarityIndex,
        baseline: Option<&dyn SimilarityIndex>,
        data: &HorizonData,
        checks: &mut Vec<CheckResult>,
    ) -> f64 {
        let Some(baseline) = baseline else {
            checks.push(CheckResult {
                name: "recall".into(),
                passed: false,
                detail: "no exact baseline available for recall estimation".into(),
            });
            return 0.0;
        };

        let k = self.cfg.recall_k;
        let mut overlap = 0usize;
        let mut total = 0usize;
        for e in sample(data, self.cfg.recall_samples) {
            let truth: std::collections::HashSet<_> = match baseline.search(&e.vector, k) {
                Ok(hits) => hits.into_iter().map(|n| n.sample_id).collect(),
                Err(_) => continue,
            };
            if let Ok(hits) = index.search(&e.vector, k) {
                total += truth.len();
                overlap += hits.iter().filter(|n| truth.contains(&n.sample_id)).count();
            }
        }
        let recall = if total == 0 {
            0.0
        } else {
            overlap as f64 / total as f64
        };

        let passed = recall >= self.cfg.recall_threshold;
        checks.push(CheckResult {
            name: "recall".into(),
            passed,
            detail: format!(
                "recall@{k} {:.3} vs threshold {:.2}",
                recall, self.cfg.recall_threshold
            ),
        });
        recall
    }
}

/// Deterministic sample of up to `n` embeddings from the store snapshot.
fn sample(data: &HorizonData, n: usize) -> Vec<&crate::types::EmbeddingRecord> {
    let mut rng = StdRng::seed_from_u64(data.content_hash);
    let mut refs: Vec<_> = data.embeddings.iter().collect();
    refs.shuffle(&mut rng);
    refs.truncate(n.max(1));
    refs
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64 * q).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}
