//! Query-time analog retrieval and ensemble aggregation.
//!
//! A retrieval consults the health monitor first, resolves a live
//! generation snapshot from the registry, searches it, and folds the
//! neighbors' recorded outcomes into a probabilistic forecast: softmax
//! ensemble weights over similarity, weighted mean, weighted empirical
//! quantiles, and a confidence score from the similarity spread.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::config::EnsembleConfig;
use crate::error::RetrievalError;
use crate::health::HealthMonitor;
use crate::registry::{IndexRegistry, LiveGeneration};
use crate::types::{
    FallbackReason, Forecast, ForecastQuantiles, HealthStatus, Horizon, Neighbor,
    OutcomeRecord, Strategy,
};

pub struct AnalogRetriever {
    registry: Arc<IndexRegistry>,
    health: Arc<HealthMonitor>,
    cfg: EnsembleConfig,
}

impl AnalogRetriever {
    pub fn new(
        registry: Arc<IndexRegistry>,
        health: Arc<HealthMonitor>,
        cfg: EnsembleConfig,
    ) -> Self {
        Self {
            registry,
            health,
            cfg,
        }
    }

    /// Retrieve the k nearest analogs and combine their outcomes.
    ///
    /// Degradation policy: an unhealthy horizon short-circuits to
    /// `IndexUnavailable`; a degraded one is served from the exact strategy
    /// with a clamped k. A small index returning fewer than k neighbors is
    /// served as-is, never an error.
    #[instrument(skip(self, query), fields(horizon = %horizon, k))]
    pub fn retrieve(
        &self,
        horizon: Horizon,
        query: &[f32],
        k: usize,
        strategy_preference: Option<Strategy>,
    ) -> Result<Forecast, RetrievalError> {
        let tracked = self.health.start(horizon);
        let status = self.health.status(horizon);

        if status == HealthStatus::Unhealthy {
            self.health
                .record_fallback(horizon, FallbackReason::IndexUnavailable);
            tracked.complete(
                &self.health,
                false,
                0,
                Some(FallbackReason::IndexUnavailable),
            );
            return Err(RetrievalError::IndexUnavailable { horizon });
        }
        let degraded = status == HealthStatus::Degraded;

        let live = match self.resolve_generation(horizon, strategy_preference, degraded) {
            Some(live) => live,
            None => {
                self.health
                    .record_fallback(horizon, FallbackReason::IndexUnavailable);
                tracked.complete(
                    &self.health,
                    false,
                    0,
                    Some(FallbackReason::IndexUnavailable),
                );
                return Err(RetrievalError::IndexUnavailable { horizon });
            }
        };

        if query.len() != live.generation.dimension {
            self.health
                .record_fallback(horizon, FallbackReason::DimensionMismatch);
            tracked.complete(
                &self.health,
                false,
                0,
                Some(FallbackReason::DimensionMismatch),
            );
            return Err(RetrievalError::DimensionMismatch {
                expected: live.generation.dimension,
                actual: query.len(),
            });
        }

        if live.index.vector_count() == 0 {
            self.health.note_index_size(horizon, 0);
            self.health
                .record_fallback(horizon, FallbackReason::IndexUnavailable);
            tracked.complete(
                &self.health,
                false,
                0,
                Some(FallbackReason::IndexUnavailable),
            );
            return Err(RetrievalError::EmptyIndex { horizon });
        }

        let requested_k = if k == 0 { self.cfg.default_k } else { k };
        let effective_k = if degraded {
            requested_k.min(self.cfg.degraded_top_k).max(1)
        } else {
            requested_k
        };

        let neighbors = match live.index.search(query, effective_k) {
            Ok(n) => n,
            Err(e) => {
                tracked.complete(&self.health, false, 0, None);
                return Err(e);
            }
        };
        if neighbors.is_empty() {
            tracked.complete(&self.health, false, 0, None);
            return Err(RetrievalError::EmptyIndex { horizon });
        }

        let forecast = assemble_forecast(
            horizon,
            live.generation.strategy,
            &neighbors,
            &live,
            self.cfg.temperature,
            degraded,
        );

        debug!(
            neighbors = neighbors.len(),
            confidence = forecast.confidence,
            degraded,
            "forecast assembled"
        );
        tracked.complete(&self.health, true, neighbors.len(), None);
        Ok(forecast)
    }

    /// Pick the generation to serve from. A degraded horizon prefers the
    /// exact strategy (correctness over latency); otherwise the caller's
    /// preference wins, defaulting to approximate. Either way the other
    /// strategy is the fallback when the preferred one is not live.
    fn resolve_generation(
        &self,
        horizon: Horizon,
        preference: Option<Strategy>,
        degraded: bool,
    ) -> Option<Arc<LiveGeneration>> {
        let primary = if degraded {
            Strategy::Exact
        } else {
            preference.unwrap_or(Strategy::Approximate)
        };
        let secondary = match primary {
            Strategy::Exact => Strategy::Approximate,
            Strategy::Approximate => Strategy::Exact,
        };
        self.registry
            .get(horizon, primary)
            .or_else(|| self.registry.get(horizon, secondary))
    }
}

fn assemble_forecast(
    horizon: Horizon,
    strategy_used: Strategy,
    neighbors: &[Neighbor],
    live: &LiveGeneration,
    temperature: f32,
    degraded: bool,
) -> Forecast {
    let mut outcomes: Vec<&OutcomeRecord> = Vec::with_capacity(neighbors.len());
    let mut similarities: Vec<f32> = Vec::with_capacity(neighbors.len());
    for n in neighbors {
        match live.outcomes.get(&n.sample_id) {
            Some(o) => {
                outcomes.push(o);
                similarities.push(n.similarity);
            }
            None => {
                // Outcome table and index come from the same store snapshot,
                // so a miss means corruption; drop the neighbor.
                warn!(sample_id = %n.sample_id, "neighbor has no outcome record, skipping");
            }
        }
    }

    let weights = softmax_weights(&similarities, temperature);
    let variables = outcomes.first().map(|o| o.values.len()).unwrap_or(0);

    let mut mean = vec![0.0f32; variables];
    for (o, w) in outcomes.iter().zip(weights.iter()) {
        for (m, v) in mean.iter_mut().zip(o.values.iter()) {
            *m += v * w;
        }
    }

    let mut p10 = Vec::with_capacity(variables);
    let mut p50 = Vec::with_capacity(variables);
    let mut p90 = Vec::with_capacity(variables);
    for var in 0..variables {
        let values: Vec<f32> = outcomes.iter().map(|o| o.values[var]).collect();
        p10.push(weighted_quantile(&values, &weights, 0.10));
        p50.push(weighted_quantile(&values, &weights, 0.50));
        p90.push(weighted_quantile(&values, &weights, 0.90));
    }

    Forecast {
        horizon,
        strategy_used,
        neighbor_count: outcomes.len(),
        mean,
        quantiles: ForecastQuantiles { p10, p50, p90 },
        confidence: confidence_score(&similarities),
        degraded,
    }
}

/// Softmax over similarities with temperature. Degenerates to uniform
/// weights when all similarities are (numerically) equal.
pub(crate) fn softmax_weights(similarities: &[f32], temperature: f32) -> Vec<f32> {
    let n = similarities.len();
    if n == 0 {
        return Vec::new();
    }
    let max = similarities.iter().cloned().fold(f32::MIN, f32::max);
    let min = similarities.iter().cloned().fold(f32::MAX, f32::min);
    if max - min < 1e-6 {
        return vec![1.0 / n as f32; n];
    }

    let tau = temperature.max(1e-3);
    let exps: Vec<f32> = similarities.iter().map(|s| ((s - max) / tau).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Weighted empirical quantile: the smallest value whose cumulative weight
/// reaches `q`.
pub(crate) fn weighted_quantile(values: &[f32], weights: &[f32], q: f32) -> f32 {
    debug_assert_eq!(values.len(), weights.len());
    if values.is_empty() {
        return 0.0;
    }
    let mut pairs: Vec<(f32, f32)> = values.iter().cloned().zip(weights.iter().cloned()).collect();
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let total: f32 = pairs.iter().map(|(_, w)| w).sum();
    let target = q * total;
    let mut cumulative = 0.0;
    for (v, w) in &pairs {
        cumulative += w;
        if cumulative >= target {
            return *v;
        }
    }
    pairs.last().map(|(v, _)| *v).unwrap_or(0.0)
}

/// Confidence from the similarity distribution: high mean similarity with a
/// tight spread scores near 1, dissimilar or scattered analogs score near 0.
pub(crate) fn confidence_score(similarities: &[f32]) -> f32 {
    if similarities.is_empty() {
        return 0.0;
    }
    let n = similarities.len() as f32;
    let mean: f32 = similarities.iter().sum::<f32>() / n;
    let variance: f32 = similarities.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;
    (mean - variance.sqrt()).clamp(0.0, 1.0)
}
