//! Index lifecycle: build, validate, back up, deploy, schedule.
//!
//! The components here own every write under the data root. The serving
//! path (registry + retriever) only ever sees generations this pipeline
//! has promoted.

pub mod backup;
pub mod builder;
pub mod deployer;
pub mod layout;
pub mod scheduler;
pub mod validator;

pub use backup::BackupManager;
pub use builder::IndexBuilder;
pub use deployer::{AtomicDeployer, DeployOutcome};
pub use layout::Layout;
pub use scheduler::{RebuildCommand, RebuildEvent, RebuildScheduler};
pub use validator::IndexValidator;

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Write a JSON sidecar via temp file + rename, matching the index payload's
/// crash-safety discipline.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
