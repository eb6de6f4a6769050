//! Core trait for similarity-index implementations.
//!
//! Both strategies (exact flat scan, IVF approximate) implement
//! `SimilarityIndex` so the retriever and validator can treat a loaded
//! generation uniformly behind a `Box<dyn SimilarityIndex>`.

use crate::error::RetrievalError;
use crate::types::{Neighbor, Strategy};

/// Nearest-neighbor search over one immutable generation's vectors.
///
/// Implementations are fully in-memory after load and take `&self` on
/// search, so an `Arc<dyn SimilarityIndex>` can be queried from any number
/// of tasks concurrently.
pub trait SimilarityIndex: Send + Sync {
    /// The strategy this index was built with.
    fn strategy(&self) -> Strategy;

    /// Return up to `k` neighbors ranked by descending cosine similarity.
    ///
    /// Returns fewer than `k` results when the index holds fewer vectors;
    /// that is not an error. Fails with `RetrievalError::DimensionMismatch`
    /// when the query length differs from the index dimension.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, RetrievalError>;

    /// Total vectors indexed.
    fn vector_count(&self) -> usize;

    /// Dimensionality of the indexed vectors.
    fn dimension(&self) -> usize;
}
