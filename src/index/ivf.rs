//! Approximate IVF index.
//!
//! Vectors are partitioned into coarse clusters via k-means; a query ranks
//! the cluster centroids and scans only the `nprobe` closest clusters. Recall
//! is traded for scan cost; the validator measures the trade against the
//! exact baseline before a generation can go live.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ApproximateParams;
use crate::error::RetrievalError;
use crate::index::distance::{cosine_similarity, squared_euclidean};
use crate::index::traits::SimilarityIndex;
use crate::types::{EmbeddingRecord, Neighbor, SampleId, Strategy};

/// One coarse cluster: the vectors assigned to a centroid.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Cluster {
    sample_ids: Vec<SampleId>,
    vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfIndex {
    dimension: usize,
    vector_count: usize,
    nprobe: usize,
    centroids: Vec<Vec<f32>>,
    clusters: Vec<Cluster>,
}

impl IvfIndex {
    /// Build from the full embedding set.
    ///
    /// The cluster count is clamped to the vector count, so tiny stores
    /// degenerate gracefully into a near-flat index. `seed` makes builds
    /// reproducible for a given store snapshot (the builder passes the
    /// content hash).
    pub fn build(
        embeddings: &[EmbeddingRecord],
        dimension: usize,
        params: &ApproximateParams,
        seed: u64,
    ) -> Self {
        let n = embeddings.len();
        let k = params.num_clusters.clamp(1, n.max(1));

        let centroids = train_centroids(embeddings, dimension, k, params.kmeans_iterations, seed);

        // Assign every vector to its nearest centroid.
        let mut clusters: Vec<Cluster> = (0..centroids.len())
            .map(|_| Cluster {
                sample_ids: Vec::new(),
                vectors: Vec::new(),
            })
            .collect();
        for e in embeddings {
            let ci = nearest_centroid(&e.vector, &centroids);
            clusters[ci].sample_ids.push(e.sample_id.clone());
            clusters[ci].vectors.push(e.vector.clone());
        }

        debug!(
            clusters = centroids.len(),
            vectors = n,
            "ivf build complete"
        );

        Self {
            dimension,
            vector_count: n,
            nprobe: params.nprobe,
            centroids,
            clusters,
        }
    }
}

impl SimilarityIndex for IvfIndex {
    fn strategy(&self) -> Strategy {
        Strategy::Approximate
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, RetrievalError> {
        if query.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 || self.vector_count == 0 {
            return Ok(Vec::new());
        }

        // Rank centroids, keep the nprobe closest.
        let mut ranked: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, cosine_similarity(query, c)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(self.nprobe.max(1));

        let mut scored: Vec<Neighbor> = Vec::new();
        for (ci, _) in &ranked {
            let cluster = &self.clusters[*ci];
            for (id, v) in cluster.sample_ids.iter().zip(cluster.vectors.iter()) {
                scored.push(Neighbor {
                    sample_id: id.clone(),
                    similarity: cosine_similarity(query, v),
                });
            }
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    fn vector_count(&self) -> usize {
        self.vector_count
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// k-means++ initialization followed by Lloyd iterations.
fn train_centroids(
    embeddings: &[EmbeddingRecord],
    dimension: usize,
    k: usize,
    iterations: usize,
    seed: u64,
) -> Vec<Vec<f32>> {
    let n = embeddings.len();
    if n == 0 {
        return Vec::new();
    }
    let mut rng = StdRng::seed_from_u64(seed);

    // k-means++: first centroid uniform, the rest weighted by squared
    // distance to the nearest chosen centroid.
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    centroids.push(embeddings[rng.gen_range(0..n)].vector.clone());
    while centroids.len() < k {
        let weights: Vec<f32> = embeddings
            .iter()
            .map(|e| {
                centroids
                    .iter()
                    .map(|c| squared_euclidean(&e.vector, c))
                    .fold(f32::MAX, f32::min)
            })
            .collect();
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            // All remaining points coincide with a centroid.
            centroids.push(embeddings[rng.gen_range(0..n)].vector.clone());
            continue;
        }
        let mut target = rng.gen_range(0.0..total);
        let mut chosen = n - 1;
        for (i, w) in weights.iter().enumerate() {
            if target < *w {
                chosen = i;
                break;
            }
            target -= w;
        }
        centroids.push(embeddings[chosen].vector.clone());
    }

    // Lloyd refinement.
    for _ in 0..iterations {
        let mut sums = vec![vec![0.0f32; dimension]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for e in embeddings {
            let ci = nearest_centroid(&e.vector, &centroids);
            counts[ci] += 1;
            for (s, v) in sums[ci].iter_mut().zip(e.vector.iter()) {
                *s += v;
            }
        }
        for (ci, centroid) in centroids.iter_mut().enumerate() {
            if counts[ci] == 0 {
                continue; // keep the stale centroid rather than divide by zero
            }
            for (c, s) in centroid.iter_mut().zip(sums[ci].iter()) {
                *c = s / counts[ci] as f32;
            }
        }
    }

    centroids
}

fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::MAX;
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_euclidean(vector, c);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn clustered_records(n_clusters: usize, per_cluster: usize, dims: usize) -> Vec<EmbeddingRecord> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut out = Vec::new();
        for ci in 0..n_clusters {
            let centroid: Vec<f32> = (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect();
            for vi in 0..per_cluster {
                let vector = centroid
                    .iter()
                    .map(|c| c + rng.gen_range(-0.05..0.05))
                    .collect();
                out.push(EmbeddingRecord {
                    sample_id: format!("c{ci}_v{vi}"),
                    vector,
                    timestamp: Utc::now(),
                });
            }
        }
        out
    }

    #[test]
    fn test_cluster_count_clamped_to_vector_count() {
        let embs = clustered_records(1, 3, 4);
        let params = ApproximateParams {
            num_clusters: 64,
            nprobe: 8,
            kmeans_iterations: 2,
        };
        let index = IvfIndex::build(&embs, 4, &params, 1);
        assert!(index.centroids.len() <= 3);
        assert_eq!(index.vector_count(), 3);
    }

    #[test]
    fn test_self_match_with_full_probe() {
        let embs = clustered_records(4, 25, 16);
        let params = ApproximateParams {
            num_clusters: 4,
            nprobe: 4, // probe everything: search is effectively exact
            kmeans_iterations: 5,
        };
        let index = IvfIndex::build(&embs, 16, &params, 42);
        for e in embs.iter().step_by(10) {
            let hits = index.search(&e.vector, 1).unwrap();
            assert_eq!(hits[0].sample_id, e.sample_id);
            assert!(hits[0].similarity > 0.999);
        }
    }

    #[test]
    fn test_recall_against_exact_baseline() {
        use crate::index::exact::ExactIndex;

        let embs = clustered_records(8, 50, 32);
        let exact = ExactIndex::build(&embs, 32);
        let params = ApproximateParams {
            num_clusters: 8,
            nprobe: 4,
            kmeans_iterations: 8,
        };
        let ivf = IvfIndex::build(&embs, 32, &params, 42);

        let k = 10;
        let mut total_overlap = 0usize;
        let queries = 20;
        for e in embs.iter().step_by(embs.len() / queries) {
            let truth: std::collections::HashSet<String> = exact
                .search(&e.vector, k)
                .unwrap()
                .into_iter()
                .map(|n| n.sample_id)
                .collect();
            let got = ivf.search(&e.vector, k).unwrap();
            total_overlap += got.iter().filter(|n| truth.contains(&n.sample_id)).count();
        }
        let recall = total_overlap as f64 / (k * queries) as f64;
        assert!(recall >= 0.8, "recall {recall:.3} too low");
    }

    #[test]
    fn test_dimension_mismatch() {
        let embs = clustered_records(2, 5, 8);
        let index = IvfIndex::build(&embs, 8, &ApproximateParams::default(), 0);
        assert!(matches!(
            index.search(&[0.0; 4], 1),
            Err(RetrievalError::DimensionMismatch { expected: 8, actual: 4 })
        ));
    }
}
