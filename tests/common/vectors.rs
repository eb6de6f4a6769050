use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cumulus::types::{EmbeddingRecord, OutcomeRecord};

/// Generate `n` paired embedding/outcome records of dimension `dims`.
///
/// Embeddings are uniform in [-1, 1]; each outcome is a deterministic
/// function of its embedding (sum, first component, index) so tests can
/// predict ensemble math from the vectors alone.
pub fn synthetic_records(
    n: usize,
    dims: usize,
    seed: u64,
) -> (Vec<EmbeddingRecord>, Vec<OutcomeRecord>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let now = Utc::now();
    let mut embeddings = Vec::with_capacity(n);
    let mut outcomes = Vec::with_capacity(n);
    for i in 0..n {
        let vector: Vec<f32> = (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let sum: f32 = vector.iter().sum();
        embeddings.push(EmbeddingRecord {
            sample_id: format!("sample_{i}"),
            vector: vector.clone(),
            timestamp: now,
        });
        outcomes.push(OutcomeRecord {
            sample_id: format!("sample_{i}"),
            values: vec![sum, vector[0], i as f32],
            timestamp: now,
        });
    }
    (embeddings, outcomes)
}

/// Records whose embeddings are all the identical vector but whose outcomes
/// differ, for exercising the equal-similarity (uniform weight) path.
pub fn identical_embedding_records(
    n: usize,
    dims: usize,
) -> (Vec<EmbeddingRecord>, Vec<OutcomeRecord>) {
    let now = Utc::now();
    let vector: Vec<f32> = (0..dims).map(|d| (d as f32 + 1.0) / dims as f32).collect();
    let embeddings = (0..n)
        .map(|i| EmbeddingRecord {
            sample_id: format!("sample_{i}"),
            vector: vector.clone(),
            timestamp: now,
        })
        .collect();
    let outcomes = (0..n)
        .map(|i| OutcomeRecord {
            sample_id: format!("sample_{i}"),
            values: vec![i as f32, 10.0 * i as f32, -(i as f32)],
            timestamp: now,
        })
        .collect();
    (embeddings, outcomes)
}
