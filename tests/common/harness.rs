use std::sync::Arc;

use tempfile::TempDir;

use cumulus::config::{ApproximateParams, Config};
use cumulus::engine::ForecastEngine;
use cumulus::lifecycle::{
    AtomicDeployer, BackupManager, IndexBuilder, IndexValidator, Layout,
};
use cumulus::registry::IndexRegistry;
use cumulus::store::VectorStore;
use cumulus::types::{EmbeddingRecord, Horizon, OutcomeRecord};

use super::vectors::synthetic_records;

/// Temp-dir backed engine setup shared by the integration tests.
///
/// The approximate index probes every cluster so validation recall is
/// deterministically 1.0, and the latency ceiling is generous enough for
/// debug builds.
pub struct TestHarness {
    pub store_dir: TempDir,
    pub data_dir: TempDir,
    pub config: Config,
}

impl TestHarness {
    pub fn new(horizons: &[u16]) -> Self {
        let store_dir = TempDir::new().unwrap();
        let data_dir = TempDir::new().unwrap();

        let mut config = Config::default();
        config.store_root = store_dir.path().to_path_buf();
        config.data_root = data_dir.path().to_path_buf();
        config.horizons = horizons.to_vec();
        config.validation.latency_ceiling_ms = 5_000.0;
        config.validation.functional_samples = 10;
        config.validation.latency_samples = 10;
        config.validation.recall_samples = 10;
        config.approximate = ApproximateParams {
            num_clusters: 8,
            nprobe: 8,
            kmeans_iterations: 4,
        };
        Self {
            store_dir,
            data_dir,
            config,
        }
    }

    /// Write `n` synthetic samples of dimension `dims` for a horizon.
    pub fn seed_horizon(&self, horizon: Horizon, n: usize, dims: usize) -> Vec<EmbeddingRecord> {
        let (embeddings, outcomes) = synthetic_records(n, dims, u64::from(horizon.0));
        self.write_horizon(horizon, &embeddings, &outcomes);
        embeddings
    }

    pub fn write_horizon(
        &self,
        horizon: Horizon,
        embeddings: &[EmbeddingRecord],
        outcomes: &[OutcomeRecord],
    ) {
        VectorStore::write_horizon(self.store_dir.path(), horizon, embeddings, outcomes).unwrap();
    }

    pub fn engine(&self) -> ForecastEngine {
        ForecastEngine::open(self.config.clone()).unwrap()
    }

    pub fn store(&self) -> VectorStore {
        VectorStore::new(self.store_dir.path())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.data_dir.path())
    }

    pub fn builder(&self) -> IndexBuilder {
        IndexBuilder::new(
            self.store(),
            self.layout(),
            self.config.build.clone(),
            self.config.approximate.clone(),
        )
    }

    pub fn validator(&self) -> IndexValidator {
        IndexValidator::new(self.store(), self.config.validation.clone())
    }

    /// Standalone deployer (and its registry) over the same data root.
    pub fn deployer(&self) -> (AtomicDeployer, Arc<IndexRegistry>) {
        let registry = Arc::new(IndexRegistry::new());
        let backup = Arc::new(BackupManager::new(self.layout(), self.config.backup.clone()));
        let deployer = AtomicDeployer::new(
            self.layout(),
            self.store(),
            backup,
            registry.clone(),
            self.config.validation.self_match_tolerance,
            3,
        );
        (deployer, registry)
    }

    pub fn backup_manager(&self) -> BackupManager {
        BackupManager::new(self.layout(), self.config.backup.clone())
    }
}
