//! Index builder: regenerates staged generations from the vector store.
//!
//! Builds never touch the live path. Each run takes the per-horizon build
//! lock, loads and verifies the store snapshot, constructs one index per
//! requested strategy on the blocking pool, and writes the artifacts into
//! a fresh staging directory. A run that outlives the configured wall-clock
//! budget is cancelled through a shared flag: the blocking task removes its
//! own staging output once it observes the flag, and the async side sweeps
//! anything written before the flag was set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::config::{ApproximateParams, BuildConfig};
use crate::error::BuildError;
use crate::index::{ExactIndex, IndexFile, IndexPayload, IvfIndex};
use crate::lifecycle::layout::{Layout, GENERATION_META, INDEX_FILE};
use crate::lifecycle::write_json;
use crate::store::{HorizonData, VectorStore};
use crate::types::{Horizon, IndexGeneration, StagedGeneration, Strategy};

pub struct IndexBuilder {
    store: VectorStore,
    layout: Layout,
    build: BuildConfig,
    approximate: ApproximateParams,
}

impl IndexBuilder {
    pub fn new(
        store: VectorStore,
        layout: Layout,
        build: BuildConfig,
        approximate: ApproximateParams,
    ) -> Self {
        Self {
            store,
            layout,
            build,
            approximate,
        }
    }

    /// Build staged generations for every requested strategy of one horizon.
    ///
    /// Re-entrancy is rejected via the build lock file, not a racy check:
    /// a second concurrent call observes lock contention and returns
    /// `BuildError::AlreadyInProgress`.
    #[instrument(skip(self, strategies), fields(horizon = %horizon))]
    pub async fn build(
        &self,
        horizon: Horizon,
        strategies: &[Strategy],
    ) -> Result<Vec<StagedGeneration>, BuildError> {
        let lock_path = self.layout.build_lock_path(horizon);
        let lock = self
            .layout
            .try_lock(&lock_path)?
            .ok_or(BuildError::AlreadyInProgress { horizon })?;

        let data = self.store.load(horizon)?;
        info!(
            vectors = data.embeddings.len(),
            dimension = data.dimension,
            content_hash = data.content_hash,
            "store snapshot loaded"
        );

        // Generation ids are fixed before the blocking work starts so a
        // timed-out run's staging directories can still be swept.
        let plans: Vec<(Strategy, ulid::Ulid)> = strategies
            .iter()
            .map(|s| (*s, ulid::Ulid::new()))
            .collect();

        let started = Instant::now();
        let layout = self.layout.clone();
        let approximate = self.approximate.clone();
        let task_plans = plans.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let task_cancel = Arc::clone(&cancel);
        let work = tokio::task::spawn_blocking(move || {
            // The build lock rides with the blocking task so an abandoned
            // run keeps excluding new builds until it exits.
            let _lock = lock;
            build_staged(&layout, &data, &task_plans, &approximate, &task_cancel)
        });

        match tokio::time::timeout(self.build.timeout(), work).await {
            Ok(joined) => joined
                .map_err(|e| BuildError::Index(format!("build task panicked: {e}")))?,
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                let elapsed = started.elapsed();
                warn!(?elapsed, "build timed out, sweeping staging artifacts");
                for (strategy, id) in &plans {
                    let dir = self.layout.staging_dir(horizon, *strategy, *id);
                    if dir.exists() {
                        let _ = std::fs::remove_dir_all(&dir);
                    }
                }
                Err(BuildError::Timeout { horizon, elapsed })
            }
        }
    }

    /// Strategies from the build config, for callers that do not override.
    pub fn default_strategies(&self) -> &[Strategy] {
        &self.build.strategies
    }
}

/// Synchronous build of every planned strategy. Runs on the blocking pool.
fn build_staged(
    layout: &Layout,
    data: &HorizonData,
    plans: &[(Strategy, ulid::Ulid)],
    approximate: &ApproximateParams,
    cancel: &AtomicBool,
) -> Result<Vec<StagedGeneration>, BuildError> {
    let mut staged: Vec<StagedGeneration> = Vec::with_capacity(plans.len());

    for (strategy, id) in plans {
        if sweep_if_cancelled(cancel, &staged) {
            return Err(BuildError::Cancelled {
                horizon: data.horizon,
            });
        }
        let started = Instant::now();
        let payload = match strategy {
            Strategy::Exact => {
                IndexPayload::Exact(ExactIndex::build(&data.embeddings, data.dimension))
            }
            Strategy::Approximate => IndexPayload::Approximate(IvfIndex::build(
                &data.embeddings,
                data.dimension,
                approximate,
                data.content_hash,
            )),
        };

        let generation = IndexGeneration {
            id: *id,
            horizon: data.horizon,
            strategy: *strategy,
            vector_count: data.embeddings.len(),
            dimension: data.dimension,
            build_timestamp: Utc::now(),
            content_hash: data.content_hash,
        };

        let dir = layout.staging_dir(data.horizon, *strategy, *id);
        std::fs::create_dir_all(&dir)?;
        let artifact = IndexFile {
            generation: generation.clone(),
            payload,
        };
        artifact.write(&dir.join(INDEX_FILE))?;
        write_json(&dir.join(GENERATION_META), &generation)?;

        crate::metrics::BUILD_DURATION
            .with_label_values(&[&data.horizon.to_string(), strategy.as_str()])
            .observe(started.elapsed().as_secs_f64());
        info!(
            %strategy,
            generation = %id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "staged generation built"
        );

        staged.push(StagedGeneration { generation, dir });

        // Covers a flag set while this strategy was being written: the
        // just-pushed directory is included in the sweep.
        if sweep_if_cancelled(cancel, &staged) {
            return Err(BuildError::Cancelled {
                horizon: data.horizon,
            });
        }
    }

    Ok(staged)
}

/// An abandoned run removes its own staging output so nothing survives the
/// timeout sweep on the async side.
fn sweep_if_cancelled(cancel: &AtomicBool, staged: &[StagedGeneration]) -> bool {
    if !cancel.load(Ordering::Relaxed) {
        return false;
    }
    for entry in staged {
        let _ = std::fs::remove_dir_all(&entry.dir);
    }
    warn!("build cancelled, staging output removed");
    true
}
