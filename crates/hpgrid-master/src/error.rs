//! Master error types.

use std::path::PathBuf;

use hpgrid_core::{ConfigError, Role};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("{} did not come up after {polls} liveness polls", roles_list(.roles))]
    StartupFailed { roles: Vec<Role>, polls: u32 },

    #[error("{role} stopped unexpectedly: {reason}")]
    ChildCrashed { role: Role, reason: String },

    #[error("failed to launch {role}: {source}")]
    Launch {
        role: Role,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] hpgrid_scheduler::SchedulerError),

    #[error("optimizer error: {0}")]
    Optimizer(#[from] hpgrid_optimizer::OptimizerError),

    #[error("job error: {0}")]
    Job(#[from] hpgrid_job::JobError),

    #[error("state store error: {0}")]
    State(#[from] hpgrid_state::StateError),
}

fn roles_list(roles: &[Role]) -> String {
    roles
        .iter()
        .map(Role::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type MasterResult<T> = Result<T, MasterError>;
