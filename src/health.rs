//! Query health tracking.
//!
//! Every retrieval is wrapped as a `TrackedQuery`; its terminal
//! `QueryOutcome` lands here. The monitor keeps a rolling count-based
//! window per horizon, classifies the horizon healthy/degraded/unhealthy,
//! and counts fallbacks by reason. It only observes; it never fails a
//! query itself. Classification steps down one severity at a time, and
//! only after a sustained run of successes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::types::{
    FallbackReason, HealthStatus, Horizon, HorizonHealthState, QueryOutcome,
};

/// An in-flight retrieval. Created at query start, finished exactly once.
pub struct TrackedQuery {
    horizon: Horizon,
    start: Instant,
}

impl TrackedQuery {
    /// Finish the query and feed its outcome to the monitor.
    pub fn complete(
        self,
        monitor: &HealthMonitor,
        success: bool,
        neighbor_count: usize,
        fallback_reason: Option<FallbackReason>,
    ) {
        monitor.record(&QueryOutcome {
            horizon: self.horizon,
            success,
            latency: self.start.elapsed(),
            neighbor_count,
            fallback_reason,
        });
    }
}

#[derive(Debug)]
struct Sample {
    success: bool,
    latency_ms: f64,
}

/// Mutable window state, guarded by one mutex per horizon. Critical
/// sections are push + recompute only; query tasks never block on another
/// task's search, just on this bookkeeping.
#[derive(Debug)]
struct WindowState {
    window: VecDeque<Sample>,
    status: HealthStatus,
    consecutive_successes: usize,
    last_success_time: Option<DateTime<Utc>>,
    degraded_since: Option<DateTime<Utc>>,
    /// Set when the live index for this horizon holds no vectors.
    zero_vectors: bool,
}

impl WindowState {
    fn new() -> Self {
        Self {
            window: VecDeque::new(),
            status: HealthStatus::Healthy,
            consecutive_successes: 0,
            last_success_time: None,
            degraded_since: None,
            zero_vectors: false,
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|s| !s.success).count();
        failures as f64 / self.window.len() as f64
    }

    fn latency_p95(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut latencies: Vec<f64> = self.window.iter().map(|s| s.latency_ms).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((latencies.len() as f64 * 0.95).ceil() as usize).clamp(1, latencies.len());
        latencies[rank - 1]
    }
}

struct HorizonHealth {
    state: Mutex<WindowState>,
    fallbacks: [AtomicU64; 4],
}

impl HorizonHealth {
    fn new() -> Self {
        Self {
            state: Mutex::new(WindowState::new()),
            fallbacks: Default::default(),
        }
    }
}

pub struct HealthMonitor {
    cfg: HealthConfig,
    horizons: DashMap<Horizon, HorizonHealth>,
}

fn severity(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Unhealthy => 2,
    }
}

impl HealthMonitor {
    pub fn new(cfg: HealthConfig) -> Self {
        Self {
            cfg,
            horizons: DashMap::new(),
        }
    }

    /// Begin tracking one retrieval.
    pub fn start(&self, horizon: Horizon) -> TrackedQuery {
        TrackedQuery {
            horizon,
            start: Instant::now(),
        }
    }

    /// Current classification; unknown horizons are healthy.
    pub fn status(&self, horizon: Horizon) -> HealthStatus {
        self.horizons
            .get(&horizon)
            .map(|h| h.state.lock().unwrap().status)
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Count a declined primary path.
    pub fn record_fallback(&self, horizon: Horizon, reason: FallbackReason) {
        let entry = self.horizons.entry(horizon).or_insert_with(HorizonHealth::new);
        entry.fallbacks[reason as usize].fetch_add(1, Ordering::Relaxed);
        crate::metrics::FALLBACKS_TOTAL
            .with_label_values(&[&horizon.to_string(), reason.as_str()])
            .inc();
        debug!(%horizon, reason = reason.as_str(), "fallback recorded");
    }

    pub fn fallback_count(&self, horizon: Horizon, reason: FallbackReason) -> u64 {
        self.horizons
            .get(&horizon)
            .map(|h| h.fallbacks[reason as usize].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Ingest one finished query and reclassify the horizon.
    pub fn record(&self, outcome: &QueryOutcome) {
        let horizon = outcome.horizon;
        let latency_ms = outcome.latency.as_secs_f64() * 1000.0;

        crate::metrics::QUERIES_TOTAL
            .with_label_values(&[
                &horizon.to_string(),
                if outcome.success { "success" } else { "failure" },
            ])
            .inc();
        crate::metrics::QUERY_DURATION
            .with_label_values(&[&horizon.to_string()])
            .observe(outcome.latency.as_secs_f64());

        let entry = self.horizons.entry(horizon).or_insert_with(HorizonHealth::new);
        let mut state = entry.state.lock().unwrap();

        state.window.push_back(Sample {
            success: outcome.success,
            latency_ms,
        });
        while state.window.len() > self.cfg.window_size {
            state.window.pop_front();
        }
        if outcome.success {
            state.consecutive_successes += 1;
            state.last_success_time = Some(Utc::now());
        } else {
            state.consecutive_successes = 0;
        }

        self.classify(horizon, &mut state);
    }

    /// Note the live index size for a horizon; a zero-vector index is
    /// immediately unhealthy.
    ///
    /// Publishing a non-empty generation over an unhealthy horizon steps it
    /// down to degraded with a fresh window. Without this, an unhealthy
    /// horizon could never recover: short-circuited queries count as
    /// failures, so successes would never accumulate.
    pub fn note_index_size(&self, horizon: Horizon, vector_count: usize) {
        let entry = self.horizons.entry(horizon).or_insert_with(HorizonHealth::new);
        let mut state = entry.state.lock().unwrap();
        state.zero_vectors = vector_count == 0;
        if vector_count > 0 && state.status == HealthStatus::Unhealthy {
            info!(
                %horizon,
                vector_count,
                "non-empty index published over unhealthy horizon, stepping down to degraded"
            );
            state.status = HealthStatus::Degraded;
            state.window.clear();
            state.consecutive_successes = 0;
        }
        self.classify(horizon, &mut state);
    }

    /// Operator override, also used to exercise degraded paths in tests.
    pub fn force_status(&self, horizon: Horizon, status: HealthStatus) {
        let entry = self.horizons.entry(horizon).or_insert_with(HorizonHealth::new);
        let mut state = entry.state.lock().unwrap();
        state.status = status;
        state.consecutive_successes = 0;
        if severity(status) > 0 && state.degraded_since.is_none() {
            state.degraded_since = Some(Utc::now());
        }
    }

    fn classify(&self, horizon: Horizon, state: &mut WindowState) {
        if state.zero_vectors {
            if state.status != HealthStatus::Unhealthy {
                info!(%horizon, "zero-vector live index, marking unhealthy");
                state.status = HealthStatus::Unhealthy;
                state.degraded_since.get_or_insert_with(Utc::now);
            }
            return;
        }
        if state.window.len() < self.cfg.min_samples {
            return;
        }

        let error_rate = state.error_rate();
        let p95 = state.latency_p95();
        let target = if error_rate >= self.cfg.critical_error_rate {
            HealthStatus::Unhealthy
        } else if error_rate >= self.cfg.warning_error_rate || p95 > self.cfg.latency_ceiling_ms {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        if severity(target) > severity(state.status) {
            info!(%horizon, from = %state.status, to = %target, error_rate, p95, "health degrading");
            state.status = target;
            state.degraded_since.get_or_insert_with(Utc::now);
            return;
        }

        // Recovery steps down one severity at a time, and only after a
        // sustained run of successes.
        if severity(target) < severity(state.status)
            && state.consecutive_successes >= self.cfg.recovery_successes
        {
            let next = match state.status {
                HealthStatus::Unhealthy => HealthStatus::Degraded,
                _ => HealthStatus::Healthy,
            };
            info!(%horizon, from = %state.status, to = %next, "health recovering");
            state.status = next;
            state.consecutive_successes = 0;
            if next == HealthStatus::Healthy {
                state.degraded_since = None;
            }
        }
    }

    /// Point-in-time snapshot for one horizon.
    pub fn state(&self, horizon: Horizon) -> HorizonHealthState {
        match self.horizons.get(&horizon) {
            Some(h) => {
                let state = h.state.lock().unwrap();
                let fallback_counters = FallbackReason::ALL
                    .iter()
                    .map(|r| {
                        (
                            r.as_str().to_string(),
                            h.fallbacks[*r as usize].load(Ordering::Relaxed),
                        )
                    })
                    .collect();
                HorizonHealthState {
                    status: state.status,
                    error_rate: state.error_rate(),
                    latency_p95_ms: state.latency_p95(),
                    window_len: state.window.len(),
                    last_success_time: state.last_success_time,
                    degraded_since: state.degraded_since,
                    fallback_counters,
                }
            }
            None => HorizonHealthState {
                status: HealthStatus::Healthy,
                error_rate: 0.0,
                latency_p95_ms: 0.0,
                window_len: 0,
                last_success_time: None,
                degraded_since: None,
                fallback_counters: FallbackReason::ALL
                    .iter()
                    .map(|r| (r.as_str().to_string(), 0))
                    .collect(),
            },
        }
    }

    /// Snapshots for every horizon seen so far.
    pub fn summary(&self) -> HashMap<Horizon, HorizonHealthState> {
        self.horizons
            .iter()
            .map(|e| (*e.key(), self.state(*e.key())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig {
            window_size: 20,
            warning_error_rate: 0.2,
            critical_error_rate: 0.6,
            latency_ceiling_ms: 100.0,
            recovery_successes: 5,
            min_samples: 5,
        })
    }

    fn outcome(h: Horizon, success: bool, ms: u64) -> QueryOutcome {
        QueryOutcome {
            horizon: h,
            success,
            latency: Duration::from_millis(ms),
            neighbor_count: if success { 10 } else { 0 },
            fallback_reason: None,
        }
    }

    #[test]
    fn test_unknown_horizon_is_healthy() {
        assert_eq!(monitor().status(Horizon(6)), HealthStatus::Healthy);
    }

    #[test]
    fn test_degrades_then_goes_unhealthy_monotonically() {
        let m = monitor();
        let h = Horizon(6);

        for _ in 0..10 {
            m.record(&outcome(h, true, 5));
        }
        assert_eq!(m.status(h), HealthStatus::Healthy);

        // Push error rate past warning (0.2) but below critical.
        for _ in 0..4 {
            m.record(&outcome(h, false, 5));
        }
        assert_eq!(m.status(h), HealthStatus::Degraded);
        assert!(m.state(h).degraded_since.is_some());

        // Past critical.
        for _ in 0..15 {
            m.record(&outcome(h, false, 5));
        }
        assert_eq!(m.status(h), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_recovery_is_stepwise_and_sustained() {
        let m = monitor();
        let h = Horizon(24);
        m.force_status(h, HealthStatus::Unhealthy);

        // Four successes: not enough to recover.
        for _ in 0..4 {
            m.record(&outcome(h, true, 5));
        }
        assert_eq!(m.status(h), HealthStatus::Unhealthy);

        // Fifth sustained success steps down exactly one level.
        m.record(&outcome(h, true, 5));
        assert_eq!(m.status(h), HealthStatus::Degraded);

        // Another sustained run reaches healthy.
        for _ in 0..5 {
            m.record(&outcome(h, true, 5));
        }
        assert_eq!(m.status(h), HealthStatus::Healthy);
        assert!(m.state(h).degraded_since.is_none());
    }

    #[test]
    fn test_latency_ceiling_degrades() {
        let m = monitor();
        let h = Horizon(6);
        for _ in 0..10 {
            m.record(&outcome(h, true, 500));
        }
        assert_eq!(m.status(h), HealthStatus::Degraded);
    }

    #[test]
    fn test_zero_vector_index_is_unhealthy() {
        let m = monitor();
        let h = Horizon(6);
        m.note_index_size(h, 0);
        assert_eq!(m.status(h), HealthStatus::Unhealthy);
        // A non-empty replacement steps down to degraded, not straight to
        // healthy; successes still have to accumulate.
        m.note_index_size(h, 1000);
        assert_eq!(m.status(h), HealthStatus::Degraded);
        for _ in 0..5 {
            m.record(&outcome(h, true, 10));
        }
        assert_eq!(m.status(h), HealthStatus::Healthy);
    }

    #[test]
    fn test_unhealthy_horizon_recovers_through_republish() {
        let m = monitor();
        let h = Horizon(6);
        for _ in 0..10 {
            m.record(&outcome(h, false, 10));
        }
        assert_eq!(m.status(h), HealthStatus::Unhealthy);
        // The failure window is discarded with the old generation, so the
        // replacement starts from a clean degraded slate.
        m.note_index_size(h, 500);
        assert_eq!(m.status(h), HealthStatus::Degraded);
        for _ in 0..5 {
            m.record(&outcome(h, true, 10));
        }
        assert_eq!(m.status(h), HealthStatus::Healthy);
    }

    #[test]
    fn test_fallback_counters_by_reason() {
        let m = monitor();
        let h = Horizon(6);
        for _ in 0..3 {
            m.record_fallback(h, FallbackReason::IndexUnavailable);
        }
        m.record_fallback(h, FallbackReason::DimensionMismatch);
        assert_eq!(m.fallback_count(h, FallbackReason::IndexUnavailable), 3);
        assert_eq!(m.fallback_count(h, FallbackReason::DimensionMismatch), 1);
        assert_eq!(m.fallback_count(h, FallbackReason::Timeout), 0);

        let state = m.state(h);
        assert_eq!(state.fallback_counters["index_unavailable"], 3);
    }

    #[test]
    fn test_tracked_query_feeds_window() {
        let m = monitor();
        let h = Horizon(6);
        for _ in 0..6 {
            let q = m.start(h);
            q.complete(&m, true, 5, None);
        }
        let state = m.state(h);
        assert_eq!(state.window_len, 6);
        assert!(state.last_success_time.is_some());
    }
}
