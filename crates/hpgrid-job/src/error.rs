//! Job error types.

use std::path::PathBuf;

use hpgrid_core::TrialId;
use thiserror::Error;

/// Errors raised by a job's actions and execution backends.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("trial not found: {0}")]
    TrialNotFound(TrialId),

    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("empty command")]
    EmptyCommand,

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected {command} output: {output}")]
    UnexpectedOutput { command: String, output: String },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state store error: {0}")]
    State(#[from] hpgrid_state::StateError),
}

pub type JobResult<T> = Result<T, JobError>;

impl JobError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}
