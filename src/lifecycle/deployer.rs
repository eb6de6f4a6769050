//! Atomic promotion of validated generations.
//!
//! The swap itself is a pair of same-filesystem renames (index payload,
//! then metadata sidecar) so no reader of the live path can observe a
//! partially written artifact. In-memory readers are insulated separately:
//! the registry entry is replaced only after the post-swap smoke check
//! passes, and snapshots already held by queries stay valid until dropped.
//!
//! A failed smoke check triggers an immediate restore of the snapshot taken
//! at the start of the deploy. This is the one failure mode that self-heals
//! without operator action.

use std::io;
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{error, info, instrument, warn};

use crate::error::DeployError;
use crate::index::IndexFile;
use crate::lifecycle::backup::BackupManager;
use crate::lifecycle::layout::{Layout, GENERATION_META, INDEX_FILE};
use crate::registry::{IndexRegistry, LiveGeneration};
use crate::store::{HorizonData, VectorStore};
use crate::types::{
    Horizon, IndexGeneration, StagedGeneration, Strategy, ValidationReport,
};

/// Result of a deploy attempt that did not error outright.
#[derive(Debug)]
pub enum DeployOutcome {
    Deployed(IndexGeneration),
    /// The smoke check failed and the previous generation was restored.
    RolledBack {
        attempted: IndexGeneration,
        reason: String,
    },
}

/// How staged artifacts become live ones.
///
/// The filesystem implementation relies on POSIX rename atomicity; an
/// object-store backend would implement the same contract with a versioned
/// key swap.
pub trait SwapMechanism: Send + Sync {
    /// Atomically replace the live artifacts with the staged ones and
    /// retire the staging directory.
    fn promote(&self, staged_dir: &Path, live_dir: &Path) -> io::Result<()>;
}

/// Rename-based swap. Staging and live live under the same data root, so
/// renames never cross a filesystem boundary.
pub struct FilesystemSwap;

impl SwapMechanism for FilesystemSwap {
    fn promote(&self, staged_dir: &Path, live_dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(live_dir)?;
        // Payload first, metadata second: a crash between the two leaves a
        // readable index with stale metadata, which bootstrap tolerates.
        std::fs::rename(staged_dir.join(INDEX_FILE), live_dir.join(INDEX_FILE))?;
        std::fs::rename(
            staged_dir.join(GENERATION_META),
            live_dir.join(GENERATION_META),
        )?;
        std::fs::remove_dir_all(staged_dir)?;
        Ok(())
    }
}

pub struct AtomicDeployer {
    layout: Layout,
    store: VectorStore,
    backup: Arc<BackupManager>,
    registry: Arc<IndexRegistry>,
    swap: Box<dyn SwapMechanism>,
    /// Smoke self-matches must score at least `1.0 - tolerance`, same as
    /// the validator's functional check.
    smoke_tolerance: f32,
    smoke_samples: usize,
}

impl AtomicDeployer {
    pub fn new(
        layout: Layout,
        store: VectorStore,
        backup: Arc<BackupManager>,
        registry: Arc<IndexRegistry>,
        smoke_tolerance: f32,
        smoke_samples: usize,
    ) -> Self {
        Self {
            layout,
            store,
            backup,
            registry,
            swap: Box::new(FilesystemSwap),
            smoke_tolerance,
            smoke_samples,
        }
    }

    /// Promote a validated staged generation to live.
    #[instrument(skip(self, staged, report), fields(generation = %staged.generation.id))]
    pub fn deploy(
        &self,
        staged: &StagedGeneration,
        report: &ValidationReport,
    ) -> Result<DeployOutcome, DeployError> {
        if !report.passed || report.generation_id != staged.generation.id {
            return Err(DeployError::ValidationNotPassed {
                generation_id: staged.generation.id,
            });
        }
        self.promote_staged(staged)
    }

    /// Roll the live generation back to the most recent backup. Restoration
    /// goes through the same swap and smoke path as a forward deploy.
    #[instrument(skip(self), fields(horizon = %horizon, strategy = %strategy))]
    pub fn rollback(
        &self,
        horizon: Horizon,
        strategy: Strategy,
    ) -> Result<DeployOutcome, DeployError> {
        let snapshot = self
            .backup
            .latest(horizon, strategy)?
            .ok_or(DeployError::NoBackup { horizon, strategy })?;
        let staged = self.backup.restore(&snapshot)?;
        info!(generation = %staged.generation.id, "rolling back to backup");
        self.promote_staged(&staged)
    }

    fn promote_staged(&self, staged: &StagedGeneration) -> Result<DeployOutcome, DeployError> {
        let generation = &staged.generation;
        let (horizon, strategy) = (generation.horizon, generation.strategy);

        if !staged.dir.join(INDEX_FILE).exists() {
            return Err(DeployError::MissingStaged {
                path: staged.dir.clone(),
            });
        }

        let lock_path = self.layout.deploy_lock_path(horizon, strategy);
        let _lock = self
            .layout
            .try_lock(&lock_path)?
            .ok_or(DeployError::LockContention { horizon, strategy })?;

        // Outcomes are captured up front; a broken store fails the deploy
        // before anything is touched.
        let data = self.store.load(horizon)?;

        let prior = self.backup.snapshot(horizon, strategy)?;

        let live_dir = self.layout.live_dir(horizon, strategy);
        self.swap.promote(&staged.dir, &live_dir)?;

        match self.smoke_check(&live_dir, &data) {
            Ok(artifact) => {
                self.registry.publish(LiveGeneration {
                    generation: artifact.generation.clone(),
                    index: artifact.payload.into_index(),
                    outcomes: data.outcome_table(),
                });
                if let Err(e) = self.backup.prune(horizon, strategy) {
                    warn!(error = %e, "backup prune failed, continuing");
                }
                crate::metrics::DEPLOYS_TOTAL
                    .with_label_values(&[&horizon.to_string(), strategy.as_str(), "deployed"])
                    .inc();
                info!(generation = %generation.id, "deploy complete");
                Ok(DeployOutcome::Deployed(artifact.generation))
            }
            Err(reason) => {
                error!(%reason, "smoke check failed after swap, restoring backup");
                self.restore_prior(prior, &live_dir, horizon, strategy)?;
                crate::metrics::DEPLOYS_TOTAL
                    .with_label_values(&[&horizon.to_string(), strategy.as_str(), "rolled_back"])
                    .inc();
                Ok(DeployOutcome::RolledBack {
                    attempted: generation.clone(),
                    reason,
                })
            }
        }
    }

    /// Post-swap smoke: reload the live artifact and run the validator's
    /// self-similarity check against sampled store embeddings.
    fn smoke_check(&self, live_dir: &Path, data: &HorizonData) -> Result<IndexFile, String> {
        let artifact = IndexFile::read(&live_dir.join(INDEX_FILE))
            .map_err(|e| format!("live artifact unreadable: {e}"))?;
        let index = artifact.payload.clone().into_index();

        let floor = 1.0 - self.smoke_tolerance;
        let mut rng = StdRng::seed_from_u64(artifact.generation.content_hash);
        let mut samples: Vec<_> = data.embeddings.iter().collect();
        samples.shuffle(&mut rng);

        for e in samples.iter().take(self.smoke_samples.max(1)) {
            let hits = index
                .search(&e.vector, 1)
                .map_err(|err| format!("smoke query failed: {err}"))?;
            match hits.first() {
                Some(top) if top.sample_id == e.sample_id && top.similarity >= floor => {}
                Some(top) => {
                    return Err(format!(
                        "smoke self-match failed for {}: got {} at {:.4}",
                        e.sample_id, top.sample_id, top.similarity
                    ))
                }
                None => return Err(format!("smoke query for {} returned nothing", e.sample_id)),
            }
        }
        Ok(artifact)
    }

    /// Put the pre-deploy snapshot back. With no prior generation the live
    /// directory is cleared and the registry entry dropped.
    fn restore_prior(
        &self,
        prior: Option<crate::types::BackupSnapshot>,
        live_dir: &Path,
        horizon: Horizon,
        strategy: Strategy,
    ) -> Result<(), DeployError> {
        match prior {
            Some(snapshot) => {
                let restored = self
                    .backup
                    .restore(&snapshot)
                    .map_err(|e| DeployError::RollbackFailed(e.to_string()))?;
                self.swap
                    .promote(&restored.dir, live_dir)
                    .map_err(|e| DeployError::RollbackFailed(e.to_string()))?;
                // The registry still serves the prior generation; the disk
                // state now matches it again.
                Ok(())
            }
            None => {
                // First-ever deploy failed: nothing was live before, so
                // clear the live path and any registry entry.
                std::fs::remove_dir_all(live_dir)
                    .map_err(|e| DeployError::RollbackFailed(e.to_string()))?;
                self.registry.remove(horizon, strategy);
                Ok(())
            }
        }
    }
}
