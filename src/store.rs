//! Read-only access to the vector store.
//!
//! The store is produced externally and is append-only: one directory per
//! horizon holding a bincode array of embeddings and a matching array of
//! outcomes. This module loads a horizon snapshot, verifies the
//! embedding/outcome correspondence, and computes the content hash the
//! build pipeline records for drift detection.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::StoreError;
use crate::types::{EmbeddingRecord, Horizon, OutcomeRecord, SampleId};

const EMBEDDINGS_FILE: &str = "embeddings.bin";
const OUTCOMES_FILE: &str = "outcomes.bin";

/// One horizon's full store snapshot, loaded into memory for a build.
#[derive(Debug, Clone)]
pub struct HorizonData {
    pub horizon: Horizon,
    pub dimension: usize,
    pub embeddings: Vec<EmbeddingRecord>,
    pub outcomes: Vec<OutcomeRecord>,
    /// xxh3 of the raw embeddings file bytes.
    pub content_hash: u64,
}

impl HorizonData {
    /// Outcome lookup table keyed by sample id, shared with the live
    /// generation so retrieval never re-reads the store.
    pub fn outcome_table(&self) -> Arc<HashMap<SampleId, OutcomeRecord>> {
        Arc::new(
            self.outcomes
                .iter()
                .map(|o| (o.sample_id.clone(), o.clone()))
                .collect(),
        )
    }
}

/// Read-only handle on the vector store root.
#[derive(Debug, Clone)]
pub struct VectorStore {
    root: PathBuf,
}

impl VectorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn horizon_dir(&self, horizon: Horizon) -> PathBuf {
        self.root.join(horizon.to_string())
    }

    /// Load and verify one horizon's snapshot.
    ///
    /// Any violation of the one-embedding-one-outcome invariant (count
    /// mismatch, positional id mismatch, ragged dimensions) is an error;
    /// the build pipeline treats it as `SourceDataInconsistent`.
    pub fn load(&self, horizon: Horizon) -> Result<HorizonData, StoreError> {
        let dir = self.horizon_dir(horizon);
        if !dir.is_dir() {
            return Err(StoreError::HorizonNotFound {
                horizon,
                root: self.root.clone(),
            });
        }

        let emb_path = dir.join(EMBEDDINGS_FILE);
        let raw = std::fs::read(&emb_path)?;
        let content_hash = xxh3_64(&raw);
        let embeddings: Vec<EmbeddingRecord> =
            bincode::deserialize(&raw).map_err(|e| StoreError::Decode(e.to_string()))?;

        let outcomes: Vec<OutcomeRecord> = {
            use bincode::Options;
            let file = File::open(dir.join(OUTCOMES_FILE))?;
            // Bound deserialization by the file length so corrupt content
            // cannot claim an arbitrarily large allocation and abort.
            let len = file.metadata()?.len();
            bincode::options()
                .with_fixint_encoding()
                .allow_trailing_bytes()
                .with_limit(len)
                .deserialize_from(BufReader::new(file))
                .map_err(|e| StoreError::Decode(e.to_string()))?
        };

        if embeddings.is_empty() {
            return Err(StoreError::Empty { horizon });
        }
        if embeddings.len() != outcomes.len() {
            return Err(StoreError::CountMismatch {
                horizon,
                embeddings: embeddings.len(),
                outcomes: outcomes.len(),
            });
        }
        for (i, (e, o)) in embeddings.iter().zip(outcomes.iter()).enumerate() {
            if e.sample_id != o.sample_id {
                return Err(StoreError::SampleIdMismatch {
                    horizon,
                    position: i,
                });
            }
        }

        let dimension = embeddings[0].vector.len();
        for e in &embeddings {
            if e.vector.len() != dimension {
                return Err(StoreError::RaggedDimension {
                    horizon,
                    expected: dimension,
                    actual: e.vector.len(),
                });
            }
        }

        debug!(
            %horizon,
            vectors = embeddings.len(),
            dimension,
            content_hash,
            "loaded horizon store"
        );

        Ok(HorizonData {
            horizon,
            dimension,
            embeddings,
            outcomes,
            content_hash,
        })
    }

    /// Hash the embeddings file without deserializing, for cheap drift
    /// checks against a live generation's recorded hash.
    pub fn content_hash(&self, horizon: Horizon) -> Result<u64, StoreError> {
        let raw = std::fs::read(self.horizon_dir(horizon).join(EMBEDDINGS_FILE))?;
        Ok(xxh3_64(&raw))
    }

    /// Write a horizon snapshot in the store's wire format.
    ///
    /// The engine never calls this on its serving path. It exists for
    /// ingestion tooling and test fixtures, and is the single definition of
    /// the format `load` reads.
    pub fn write_horizon(
        root: &Path,
        horizon: Horizon,
        embeddings: &[EmbeddingRecord],
        outcomes: &[OutcomeRecord],
    ) -> Result<(), StoreError> {
        let dir = root.join(horizon.to_string());
        std::fs::create_dir_all(&dir)?;

        let write = |name: &str, encode: &dyn Fn(&mut BufWriter<File>) -> Result<(), StoreError>| {
            let path = dir.join(name);
            let mut writer = BufWriter::new(File::create(&path)?);
            encode(&mut writer)?;
            writer.flush()?;
            Ok::<(), StoreError>(())
        };

        write(EMBEDDINGS_FILE, &|w| {
            bincode::serialize_into(w, embeddings).map_err(|e| StoreError::Decode(e.to_string()))
        })?;
        write(OUTCOMES_FILE, &|w| {
            bincode::serialize_into(w, outcomes).map_err(|e| StoreError::Decode(e.to_string()))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(n: usize, dims: usize) -> (Vec<EmbeddingRecord>, Vec<OutcomeRecord>) {
        let now = Utc::now();
        let embeddings = (0..n)
            .map(|i| EmbeddingRecord {
                sample_id: format!("s{i}"),
                vector: vec![i as f32; dims],
                timestamp: now,
            })
            .collect();
        let outcomes = (0..n)
            .map(|i| OutcomeRecord {
                sample_id: format!("s{i}"),
                values: vec![i as f32 * 2.0, -1.0],
                timestamp: now,
            })
            .collect();
        (embeddings, outcomes)
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (embs, outs) = sample(20, 8);
        VectorStore::write_horizon(dir.path(), Horizon(6), &embs, &outs).unwrap();

        let store = VectorStore::new(dir.path());
        let data = store.load(Horizon(6)).unwrap();
        assert_eq!(data.embeddings.len(), 20);
        assert_eq!(data.dimension, 8);
        assert_eq!(data.outcomes[3].values[0], 6.0);
        assert_eq!(data.content_hash, store.content_hash(Horizon(6)).unwrap());
    }

    #[test]
    fn test_count_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (embs, mut outs) = sample(10, 4);
        outs.pop();
        VectorStore::write_horizon(dir.path(), Horizon(6), &embs, &outs).unwrap();

        let err = VectorStore::new(dir.path()).load(Horizon(6)).unwrap_err();
        match err {
            StoreError::CountMismatch {
                embeddings,
                outcomes,
                ..
            } => {
                assert_eq!(embeddings, 10);
                assert_eq!(outcomes, 9);
            }
            other => panic!("expected CountMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_sample_id_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (embs, mut outs) = sample(5, 4);
        outs[2].sample_id = "rogue".into();
        VectorStore::write_horizon(dir.path(), Horizon(6), &embs, &outs).unwrap();

        let err = VectorStore::new(dir.path()).load(Horizon(6)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::SampleIdMismatch { position: 2, .. }
        ));
    }

    #[test]
    fn test_missing_horizon() {
        let dir = tempfile::tempdir().unwrap();
        let err = VectorStore::new(dir.path()).load(Horizon(48)).unwrap_err();
        assert!(matches!(err, StoreError::HorizonNotFound { .. }));
    }

    #[test]
    fn test_ragged_dimension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut embs, outs) = sample(5, 4);
        embs[4].vector.push(0.0);
        VectorStore::write_horizon(dir.path(), Horizon(6), &embs, &outs).unwrap();

        let err = VectorStore::new(dir.path()).load(Horizon(6)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::RaggedDimension {
                expected: 4,
                actual: 5,
                ..
            }
        ));
    }
}
