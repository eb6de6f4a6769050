//! The engine facade.
//!
//! `ForecastEngine` wires the store, lifecycle components, registry, health
//! monitor, and retriever together and exposes the serving surface: query
//! retrieval, the health summary, and the administrative rebuild/rollback
//! operations. The HTTP layer above this crate holds one engine and calls
//! into it; nothing here knows about transport.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::info;

use crate::config::Config;
use crate::error::{CumulusError, DeployError, Result, RetrievalError};
use crate::health::HealthMonitor;
use crate::lifecycle::deployer::DeployOutcome;
use crate::lifecycle::scheduler::{HorizonSchedule, RebuildCommand, RebuildEvent};
use crate::lifecycle::{
    AtomicDeployer, BackupManager, IndexBuilder, IndexValidator, Layout, RebuildScheduler,
};
use crate::registry::IndexRegistry;
use crate::retriever::AnalogRetriever;
use crate::store::VectorStore;
use crate::types::{Forecast, Horizon, HorizonHealthState, IndexGeneration, Strategy};

/// Handle to a triggered rebuild: subscribe to the event stream to follow
/// its progress.
pub struct RebuildHandle {
    pub horizon: Option<Horizon>,
    pub events: broadcast::Receiver<RebuildEvent>,
}

/// One horizon's slice of the health summary.
#[derive(Debug, Clone, Serialize)]
pub struct HorizonReport {
    pub horizon: Horizon,
    pub health: HorizonHealthState,
    pub live_generations: Vec<IndexGeneration>,
    pub schedule: Option<HorizonSchedule>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub horizons: Vec<HorizonReport>,
}

pub struct ForecastEngine {
    config: Config,
    store: VectorStore,
    layout: Layout,
    registry: Arc<IndexRegistry>,
    health: Arc<HealthMonitor>,
    retriever: AnalogRetriever,
    deployer: Arc<AtomicDeployer>,
    scheduler: Arc<RebuildScheduler>,
    commands: mpsc::Sender<RebuildCommand>,
    command_rx: std::sync::Mutex<Option<mpsc::Receiver<RebuildCommand>>>,
    shutdown: watch::Sender<bool>,
}

impl ForecastEngine {
    /// Wire up the engine and republish any generations already live on
    /// disk. Does not start the background scheduler; call
    /// [`start_scheduler`](Self::start_scheduler) for that.
    pub fn open(config: Config) -> Result<Self> {
        crate::metrics::init();

        let store = VectorStore::new(&config.store_root);
        let layout = Layout::new(&config.data_root);
        let registry = Arc::new(IndexRegistry::new());
        let health = Arc::new(HealthMonitor::new(config.health.clone()));

        let backup = Arc::new(BackupManager::new(layout.clone(), config.backup.clone()));
        let builder = Arc::new(IndexBuilder::new(
            store.clone(),
            layout.clone(),
            config.build.clone(),
            config.approximate.clone(),
        ));
        let validator = Arc::new(IndexValidator::new(
            store.clone(),
            config.validation.clone(),
        ));
        let deployer = Arc::new(AtomicDeployer::new(
            layout.clone(),
            store.clone(),
            backup,
            registry.clone(),
            config.validation.self_match_tolerance,
            config.validation.functional_samples.min(5),
        ));
        let scheduler = Arc::new(RebuildScheduler::new(
            config.scheduler.clone(),
            config.horizons(),
            builder,
            validator,
            deployer.clone(),
        ));

        let retriever = AnalogRetriever::new(
            registry.clone(),
            health.clone(),
            config.ensemble.clone(),
        );

        let (commands, command_rx) = mpsc::channel(32);
        let (shutdown, _) = watch::channel(false);

        let engine = Self {
            config,
            store,
            layout,
            registry,
            health,
            retriever,
            deployer,
            scheduler,
            commands,
            command_rx: std::sync::Mutex::new(Some(command_rx)),
            shutdown,
        };
        engine.bootstrap()?;
        Ok(engine)
    }

    fn bootstrap(&self) -> Result<()> {
        let count =
            self.registry
                .bootstrap(&self.layout, &self.store, &self.config.horizons())?;
        for generation in self.registry.generations() {
            self.health
                .note_index_size(generation.horizon, generation.vector_count);
        }
        info!(live_generations = count, "engine opened");
        Ok(())
    }

    /// Spawn the background rebuild loop. Idempotent: subsequent calls are
    /// no-ops.
    pub fn start_scheduler(&self) {
        if let Some(rx) = self.command_rx.lock().unwrap().take() {
            let scheduler = self.scheduler.clone();
            let shutdown_rx = self.shutdown.subscribe();
            tokio::spawn(scheduler.run(rx, shutdown_rx));
        }
    }

    /// Stop the background loop. In-flight pipeline tasks finish on their
    /// own; the swap critical section is sub-second and never interrupted.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// The primary serving API.
    pub fn retrieve(
        &self,
        horizon: Horizon,
        query: &[f32],
        k: usize,
    ) -> std::result::Result<Forecast, RetrievalError> {
        self.retriever.retrieve(horizon, query, k, None)
    }

    /// `retrieve` with an explicit strategy preference.
    pub fn retrieve_with(
        &self,
        horizon: Horizon,
        query: &[f32],
        k: usize,
        strategy: Strategy,
    ) -> std::result::Result<Forecast, RetrievalError> {
        self.retriever.retrieve(horizon, query, k, Some(strategy))
    }

    /// Queue a rebuild for one horizon (or all) on the background loop.
    pub fn trigger_rebuild(&self, horizon: Option<Horizon>) -> Result<RebuildHandle> {
        let events = self.scheduler.subscribe();
        self.commands
            .try_send(RebuildCommand::RebuildNow { horizon })
            .map_err(|e| CumulusError::Internal(format!("rebuild queue full: {e}")))?;
        Ok(RebuildHandle { horizon, events })
    }

    /// Run the full pipeline for one horizon inline and wait for it.
    pub async fn rebuild_and_wait(&self, horizon: Horizon) -> Result<()> {
        if self.scheduler.rebuild_now(horizon).await {
            self.refresh_index_sizes();
            Ok(())
        } else {
            Err(CumulusError::Internal(format!(
                "rebuild failed for horizon {horizon}"
            )))
        }
    }

    /// Roll one (horizon, strategy) back to its most recent backup.
    pub fn rollback(
        &self,
        horizon: Horizon,
        strategy: Strategy,
    ) -> std::result::Result<DeployOutcome, DeployError> {
        let outcome = self.deployer.rollback(horizon, strategy)?;
        self.refresh_index_sizes();
        Ok(outcome)
    }

    /// Point-in-time health and metadata for every configured horizon.
    pub fn health_summary(&self) -> HealthSummary {
        let generations = self.registry.generations();
        let schedules = self.scheduler.schedules();
        let horizons = self
            .config
            .horizons()
            .into_iter()
            .map(|horizon| HorizonReport {
                horizon,
                health: self.health.state(horizon),
                live_generations: generations
                    .iter()
                    .filter(|g| g.horizon == horizon)
                    .cloned()
                    .collect(),
                schedule: schedules
                    .iter()
                    .find(|(h, _)| *h == horizon)
                    .map(|(_, s)| s.clone()),
            })
            .collect();
        HealthSummary { horizons }
    }

    /// Direct access for callers that need raw health state (metrics
    /// exporters, tests).
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn registry(&self) -> &Arc<IndexRegistry> {
        &self.registry
    }

    fn refresh_index_sizes(&self) {
        for generation in self.registry.generations() {
            self.health
                .note_index_size(generation.horizon, generation.vector_count);
        }
    }
}
