//! Optimizer error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("unknown search algorithm: {0:?} (expected \"random\" or \"grid\")")]
    UnknownSampler(String),

    #[error("grid search space has {points} points, fewer than trial_number = {trial_number}")]
    SearchSpaceTooSmall { points: u64, trial_number: u64 },

    #[error("job error: {0}")]
    Job(#[from] hpgrid_job::JobError),

    #[error("state store error: {0}")]
    State(#[from] hpgrid_state::StateError),
}

pub type OptimizerResult<T> = Result<T, OptimizerError>;
