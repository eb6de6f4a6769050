//! Versioned backups of previously live generations.
//!
//! A snapshot is taken right before every swap so the deployer always has a
//! rollback target. Restoration materializes the backup into staging and
//! hands it back through the deployer's swap path, so rollback gets the same
//! atomicity and smoke test as a normal deploy. Retention enforces a count
//! and age limit but never removes the sole remaining rollback target.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};

use chrono::{Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, instrument};

use crate::config::BackupConfig;
use crate::lifecycle::layout::{Layout, GENERATION_META, INDEX_FILE, SNAPSHOT_META};
use crate::lifecycle::{read_json, write_json};
use crate::types::{BackupSnapshot, Horizon, IndexGeneration, StagedGeneration, Strategy};

const COMPRESSED_INDEX_FILE: &str = "index.bin.gz";

pub struct BackupManager {
    layout: Layout,
    cfg: BackupConfig,
}

impl BackupManager {
    pub fn new(layout: Layout, cfg: BackupConfig) -> Self {
        Self { layout, cfg }
    }

    /// Snapshot the currently live generation, if any.
    #[instrument(skip(self), fields(horizon = %horizon, strategy = %strategy))]
    pub fn snapshot(
        &self,
        horizon: Horizon,
        strategy: Strategy,
    ) -> io::Result<Option<BackupSnapshot>> {
        let meta_path = self.layout.live_meta(horizon, strategy);
        if !meta_path.exists() {
            return Ok(None);
        }
        let generation: IndexGeneration = read_json(&meta_path)?;

        let stored_at = Utc::now();
        let dir = self.layout.backups_dir(horizon, strategy).join(format!(
            "{}_{}",
            stored_at.format("%Y%m%dT%H%M%S%3f"),
            generation.id
        ));
        std::fs::create_dir_all(&dir)?;

        let live_index = self.layout.live_index(horizon, strategy);
        if self.cfg.compress {
            let mut reader = BufReader::new(File::open(&live_index)?);
            let mut encoder = GzEncoder::new(
                BufWriter::new(File::create(dir.join(COMPRESSED_INDEX_FILE))?),
                Compression::default(),
            );
            io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?;
        } else {
            std::fs::copy(&live_index, dir.join(INDEX_FILE))?;
        }

        let snapshot = BackupSnapshot {
            generation,
            stored_at,
            compressed: self.cfg.compress,
            retention_expires_at: stored_at + Duration::days(self.cfg.max_age_days),
            dir: dir.clone(),
        };
        write_json(&dir.join(SNAPSHOT_META), &snapshot)?;

        info!(generation = %snapshot.generation.id, dir = %dir.display(), "live generation snapshotted");
        Ok(Some(snapshot))
    }

    /// Materialize a backup into staging so it can be re-deployed through
    /// the normal swap + smoke-test path. The restored generation keeps its
    /// original id.
    #[instrument(skip(self, snapshot), fields(generation = %snapshot.generation.id))]
    pub fn restore(&self, snapshot: &BackupSnapshot) -> io::Result<StagedGeneration> {
        let generation = snapshot.generation.clone();
        let dir = self
            .layout
            .staging_dir(generation.horizon, generation.strategy, generation.id);
        std::fs::create_dir_all(&dir)?;

        let target = dir.join(INDEX_FILE);
        if snapshot.compressed {
            let mut decoder =
                GzDecoder::new(BufReader::new(File::open(snapshot.dir.join(COMPRESSED_INDEX_FILE))?));
            let mut writer = BufWriter::new(File::create(&target)?);
            io::copy(&mut decoder, &mut writer)?;
        } else {
            std::fs::copy(snapshot.dir.join(INDEX_FILE), &target)?;
        }
        write_json(&dir.join(GENERATION_META), &generation)?;

        info!(dir = %dir.display(), "backup restored into staging");
        Ok(StagedGeneration { generation, dir })
    }

    /// All backups for one (horizon, strategy), oldest first.
    pub fn list(&self, horizon: Horizon, strategy: Strategy) -> io::Result<Vec<BackupSnapshot>> {
        let root = self.layout.backups_dir(horizon, strategy);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let meta = entry?.path().join(SNAPSHOT_META);
            if meta.exists() {
                snapshots.push(read_json::<BackupSnapshot>(&meta)?);
            }
        }
        snapshots.sort_by_key(|s| s.stored_at);
        Ok(snapshots)
    }

    /// The most recent backup, the default rollback target.
    pub fn latest(&self, horizon: Horizon, strategy: Strategy) -> io::Result<Option<BackupSnapshot>> {
        Ok(self.list(horizon, strategy)?.into_iter().next_back())
    }

    /// Enforce retention. Removes expired backups and the oldest beyond
    /// `max_count`, always keeping the newest snapshot. Returns the number
    /// pruned.
    #[instrument(skip(self), fields(horizon = %horizon, strategy = %strategy))]
    pub fn prune(&self, horizon: Horizon, strategy: Strategy) -> io::Result<usize> {
        let snapshots = self.list(horizon, strategy)?;
        if snapshots.len() <= 1 {
            return Ok(0);
        }

        let now = Utc::now();
        let newest = snapshots.len() - 1;
        let mut doomed: Vec<&BackupSnapshot> = Vec::new();

        for (i, s) in snapshots.iter().enumerate() {
            if i == newest {
                continue;
            }
            let over_count = snapshots.len() - doomed.len() > self.cfg.max_count;
            let expired = s.retention_expires_at < now;
            if expired || over_count {
                doomed.push(s);
            }
        }

        for s in &doomed {
            debug!(generation = %s.generation.id, dir = %s.dir.display(), "pruning backup");
            std::fs::remove_dir_all(&s.dir)?;
        }
        if !doomed.is_empty() {
            crate::metrics::BACKUPS_PRUNED_TOTAL
                .with_label_values(&[&horizon.to_string(), strategy.as_str()])
                .inc_by(doomed.len() as u64);
        }
        Ok(doomed.len())
    }
}
