//! The live-generation registry.
//!
//! Readers resolve `(horizon, strategy)` to an `Arc<LiveGeneration>` and
//! then run the whole query against that snapshot; a deploy that lands
//! mid-query swaps the map entry but cannot disturb the snapshot already
//! held. The superseded generation is reclaimed when its last reader drops
//! the `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::Result;
use crate::index::{IndexFile, SimilarityIndex};
use crate::lifecycle::layout::Layout;
use crate::store::VectorStore;
use crate::types::{Horizon, IndexGeneration, OutcomeRecord, SampleId, Strategy};

/// One deployed generation, fully loaded for serving: the searchable index
/// plus the outcome table captured from the store at publish time.
pub struct LiveGeneration {
    pub generation: IndexGeneration,
    pub index: Arc<dyn SimilarityIndex>,
    pub outcomes: Arc<HashMap<SampleId, OutcomeRecord>>,
}

#[derive(Default)]
pub struct IndexRegistry {
    map: DashMap<(Horizon, Strategy), Arc<LiveGeneration>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the live generation for a (horizon, strategy). The returned
    /// `Arc` stays valid for the caller regardless of concurrent deploys.
    pub fn get(&self, horizon: Horizon, strategy: Strategy) -> Option<Arc<LiveGeneration>> {
        self.map.get(&(horizon, strategy)).map(|e| e.value().clone())
    }

    /// Replace (or install) the live generation. Readers of the previous
    /// generation are unaffected.
    pub fn publish(&self, live: LiveGeneration) {
        let key = (live.generation.horizon, live.generation.strategy);
        info!(
            horizon = %key.0,
            strategy = %key.1,
            generation = %live.generation.id,
            vectors = live.generation.vector_count,
            "publishing live generation"
        );
        self.map.insert(key, Arc::new(live));
    }

    pub fn remove(&self, horizon: Horizon, strategy: Strategy) {
        self.map.remove(&(horizon, strategy));
    }

    /// Metadata of every live generation, for the health summary.
    pub fn generations(&self) -> Vec<IndexGeneration> {
        self.map.iter().map(|e| e.value().generation.clone()).collect()
    }

    /// Scan `live/` on startup and republish every generation found there,
    /// pairing each index with its horizon's current outcome table. Entries
    /// that fail to load are skipped with a warning rather than aborting
    /// startup.
    pub fn bootstrap(&self, layout: &Layout, store: &VectorStore, horizons: &[Horizon]) -> Result<usize> {
        let mut count = 0;
        for &horizon in horizons {
            let data = match store.load(horizon) {
                Ok(d) => d,
                Err(e) => {
                    warn!(%horizon, error = %e, "skipping horizon during bootstrap");
                    continue;
                }
            };
            let outcomes = data.outcome_table();
            for strategy in [Strategy::Exact, Strategy::Approximate] {
                let path = layout.live_index(horizon, strategy);
                if !path.exists() {
                    continue;
                }
                match IndexFile::read(&path) {
                    Ok(artifact) => {
                        self.publish(LiveGeneration {
                            generation: artifact.generation,
                            index: artifact.payload.into_index(),
                            outcomes: outcomes.clone(),
                        });
                        count += 1;
                    }
                    Err(e) => {
                        warn!(%horizon, %strategy, error = %e, "unreadable live index, leaving unpublished");
                    }
                }
            }
        }
        info!(count, "bootstrap complete");
        Ok(count)
    }
}
