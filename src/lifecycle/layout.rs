//! The managed on-disk layout.
//!
//! ```text
//! data_root/
//!   live/<horizon>/<strategy>/index.bin + generation.json
//!   staging/<horizon>/<strategy>/<gen-id>/index.bin + generation.json
//!   backups/<horizon>/<strategy>/<ts>_<gen-id>/index.bin[.gz] + snapshot.json
//!   locks/build-<horizon>.lock, deploy-<horizon>-<strategy>.lock
//! ```
//!
//! External tooling may read `live/` and `backups/`; `staging/` is private
//! to the build pipeline. All writers go through the advisory locks below.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use ulid::Ulid;

use crate::types::{Horizon, Strategy};

pub const INDEX_FILE: &str = "index.bin";
pub const GENERATION_META: &str = "generation.json";
pub const SNAPSHOT_META: &str = "snapshot.json";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn live_dir(&self, horizon: Horizon, strategy: Strategy) -> PathBuf {
        self.root
            .join("live")
            .join(horizon.to_string())
            .join(strategy.as_str())
    }

    pub fn live_index(&self, horizon: Horizon, strategy: Strategy) -> PathBuf {
        self.live_dir(horizon, strategy).join(INDEX_FILE)
    }

    pub fn live_meta(&self, horizon: Horizon, strategy: Strategy) -> PathBuf {
        self.live_dir(horizon, strategy).join(GENERATION_META)
    }

    pub fn staging_dir(&self, horizon: Horizon, strategy: Strategy, id: Ulid) -> PathBuf {
        self.root
            .join("staging")
            .join(horizon.to_string())
            .join(strategy.as_str())
            .join(id.to_string())
    }

    /// All staged generations for one (horizon, strategy), any build.
    pub fn staging_root(&self, horizon: Horizon, strategy: Strategy) -> PathBuf {
        self.root
            .join("staging")
            .join(horizon.to_string())
            .join(strategy.as_str())
    }

    pub fn backups_dir(&self, horizon: Horizon, strategy: Strategy) -> PathBuf {
        self.root
            .join("backups")
            .join(horizon.to_string())
            .join(strategy.as_str())
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn build_lock_path(&self, horizon: Horizon) -> PathBuf {
        self.locks_dir().join(format!("build-{horizon}.lock"))
    }

    pub fn deploy_lock_path(&self, horizon: Horizon, strategy: Strategy) -> PathBuf {
        self.locks_dir()
            .join(format!("deploy-{horizon}-{strategy}.lock"))
    }

    /// Try to take an exclusive advisory lock. Returns `None` when another
    /// process (or task) already holds it; never blocks.
    pub fn try_lock(&self, path: &Path) -> std::io::Result<Option<LockGuard>> {
        std::fs::create_dir_all(self.locks_dir())?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LockGuard { file })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Held advisory lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_keep_live_staging_backups_separate() {
        let layout = Layout::new("/data");
        let live = layout.live_index(Horizon(6), Strategy::Exact);
        let staging = layout.staging_dir(Horizon(6), Strategy::Exact, Ulid::nil());
        let backups = layout.backups_dir(Horizon(6), Strategy::Exact);
        assert!(live.starts_with("/data/live/6h/exact"));
        assert!(staging.starts_with("/data/staging/6h/exact"));
        assert!(backups.starts_with("/data/backups/6h/exact"));
    }

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let path = layout.build_lock_path(Horizon(6));

        let guard = layout.try_lock(&path).unwrap();
        assert!(guard.is_some());
        // A second holder in the same process contends.
        assert!(layout.try_lock(&path).unwrap().is_none());

        drop(guard);
        assert!(layout.try_lock(&path).unwrap().is_some());
    }
}
