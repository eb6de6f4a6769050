//! Exact flat index: brute-force cosine scan over every vector.
//!
//! This is the correctness baseline: the validator measures approximate
//! recall against it, and the retriever prefers it when a horizon is
//! degraded.

use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;
use crate::index::distance::cosine_similarity;
use crate::index::traits::SimilarityIndex;
use crate::types::{EmbeddingRecord, Neighbor, SampleId, Strategy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactIndex {
    dimension: usize,
    sample_ids: Vec<SampleId>,
    vectors: Vec<Vec<f32>>,
}

impl ExactIndex {
    /// Build from the full embedding set. The caller (the build pipeline)
    /// has already verified uniform dimensions.
    pub fn build(embeddings: &[EmbeddingRecord], dimension: usize) -> Self {
        let sample_ids = embeddings.iter().map(|e| e.sample_id.clone()).collect();
        let vectors = embeddings.iter().map(|e| e.vector.clone()).collect();
        Self {
            dimension,
            sample_ids,
            vectors,
        }
    }
}

impl SimilarityIndex for ExactIndex {
    fn strategy(&self) -> Strategy {
        Strategy::Exact
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, RetrievalError> {
        if query.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<Neighbor> = self
            .vectors
            .iter()
            .zip(self.sample_ids.iter())
            .map(|(v, id)| Neighbor {
                sample_id: id.clone(),
                similarity: cosine_similarity(query, v),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    fn vector_count(&self) -> usize {
        self.vectors.len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
