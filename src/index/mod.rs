//! Similarity indices for analog retrieval.
//!
//! Provides the `SimilarityIndex` trait, cosine-similarity primitives, the
//! two concrete strategies (exact flat, approximate IVF), and the bincode
//! on-disk codec shared by the build, validation, and deploy paths.

pub mod distance;
pub mod exact;
pub mod ivf;
pub mod traits;

pub use exact::ExactIndex;
pub use ivf::IvfIndex;
pub use traits::SimilarityIndex;

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::IndexGeneration;

/// Serialized index payload, tagged by strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexPayload {
    Exact(ExactIndex),
    Approximate(IvfIndex),
}

impl IndexPayload {
    pub fn into_index(self) -> Arc<dyn SimilarityIndex> {
        match self {
            IndexPayload::Exact(i) => Arc::new(i),
            IndexPayload::Approximate(i) => Arc::new(i),
        }
    }
}

/// The complete on-disk index artifact: generation metadata plus payload.
///
/// Written once into staging, then only ever moved whole, so live and
/// backup copies are byte-identical to the staged original.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFile {
    pub generation: IndexGeneration,
    pub payload: IndexPayload,
}

impl IndexFile {
    /// Write to `path` via a sibling temp file and rename, so a partially
    /// written artifact is never visible under the final name.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let tmp = path.with_extension("bin.tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(&mut writer, self)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)
    }

    pub fn read(path: &Path) -> std::io::Result<Self> {
        use bincode::Options;
        let file = File::open(path)?;
        // Bound deserialization by the file length so corrupt content cannot
        // claim an arbitrarily large allocation and abort the process.
        let len = file.metadata()?.len();
        let reader = BufReader::new(file);
        bincode::options()
            .with_fixint_encoding()
            .allow_trailing_bytes()
            .with_limit(len)
            .deserialize_from(reader)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
