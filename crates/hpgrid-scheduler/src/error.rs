//! Scheduler error types.

use std::path::PathBuf;

use hpgrid_core::{ConfigError, TrialId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("trial {0} is already tracked by a job")]
    AlreadyTracked(TrialId),

    #[error("unknown scheduling algorithm: {0:?} (expected \"random\" or \"fifo\")")]
    UnknownAlgorithm(String),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("job error: {0}")]
    Job(#[from] hpgrid_job::JobError),

    #[error("state store error: {0}")]
    State(#[from] hpgrid_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
