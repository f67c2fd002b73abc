use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a run.
///
/// Weight snapshots that only partially match the live model are not errors:
/// they are reported through `WeightLoadReport` and the run continues.
#[derive(Error, Debug)]
pub enum TrainError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown model kind '{tag}', expected one of: {known}")]
    UnknownModel { tag: String, known: String },

    #[error("batch size {batch_size} is not a multiple of forward batch size {forward_batch_size}")]
    BatchSizeMismatch {
        batch_size: usize,
        forward_batch_size: usize,
    },

    #[error("evaluate-only mode requires a weights path (--weights)")]
    MissingWeights,

    #[error("cannot restore checkpoint {path}: {reason}")]
    CheckpointRestore { path: PathBuf, reason: String },

    #[error("optimizer state mismatch: {0}")]
    OptimizerMismatch(String),

    #[error("scheduler state mismatch: checkpoint holds {found}, run is configured with {expected}")]
    SchedulerMismatch { expected: String, found: String },

    #[error("evaluation views are misaligned: {0}")]
    ViewMisaligned(String),

    #[error("data loader worker {0} terminated unexpectedly")]
    LoaderWorker(usize),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;
