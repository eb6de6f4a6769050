use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{Horizon, Strategy};

/// Errors from reading the vector store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("horizon {horizon} not found under {root}")]
    HorizonNotFound { horizon: Horizon, root: PathBuf },

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store decode error: {0}")]
    Decode(String),

    #[error("empty store for horizon {horizon}")]
    Empty { horizon: Horizon },

    #[error(
        "inconsistent store for horizon {horizon}: {embeddings} embeddings vs {outcomes} outcomes"
    )]
    CountMismatch {
        horizon: Horizon,
        embeddings: usize,
        outcomes: usize,
    },

    #[error("sample id mismatch at position {position} for horizon {horizon}")]
    SampleIdMismatch { horizon: Horizon, position: usize },

    #[error("ragged embedding dimensions for horizon {horizon}: expected {expected}, got {actual}")]
    RaggedDimension {
        horizon: Horizon,
        expected: usize,
        actual: usize,
    },
}

/// Errors from the index build pipeline.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("build already in progress for horizon {horizon}")]
    AlreadyInProgress { horizon: Horizon },

    #[error("build timed out for horizon {horizon} after {elapsed:?}")]
    Timeout { horizon: Horizon, elapsed: Duration },

    #[error("build cancelled for horizon {horizon}")]
    Cancelled { horizon: Horizon },

    #[error("source data inconsistent: {0}")]
    SourceDataInconsistent(#[from] StoreError),

    #[error("index construction failed: {0}")]
    Index(String),

    #[error("build io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("build encode error: {0}")]
    Encode(String),
}

/// Errors from deployment. A failed smoke test is not surfaced here: the
/// deployer rolls back automatically and reports it via `DeployOutcome`.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("deploy lock contention for {horizon}/{strategy}")]
    LockContention { horizon: Horizon, strategy: Strategy },

    #[error("refusing to deploy {generation_id}: validation did not pass")]
    ValidationNotPassed { generation_id: ulid::Ulid },

    #[error("staged generation missing at {path}")]
    MissingStaged { path: PathBuf },

    #[error("no backup available to roll back {horizon}/{strategy}")]
    NoBackup { horizon: Horizon, strategy: Strategy },

    #[error("rollback failed after smoke-test failure: {0}")]
    RollbackFailed(String),

    #[error("store unreadable at deploy time: {0}")]
    Store(#[from] StoreError),

    #[error("deploy io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("deploy encode error: {0}")]
    Encode(String),
}

/// Errors surfaced to retrieval callers. Always a typed result, never a panic.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("index unavailable for horizon {horizon}")]
    IndexUnavailable { horizon: Horizon },

    #[error("query dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index for horizon {horizon} holds no vectors")]
    EmptyIndex { horizon: Horizon },
}

/// Umbrella error for engine-level operations.
#[derive(Error, Debug)]
pub enum CumulusError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CumulusError>;
