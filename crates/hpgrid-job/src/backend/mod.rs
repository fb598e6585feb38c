//! Execution backends: where a trial's command actually runs.

mod abci;
mod local;
pub mod qstat;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use hpgrid_core::config::ResourceType;
use hpgrid_core::{HpgridConfig, TrialId, Workspace};
use hpgrid_state::{TrialRecord, TrialStore};

use crate::error::JobResult;

pub use abci::AbciBackend;
pub use local::LocalBackend;

/// Runs, observes and kills trial commands for the job state machine.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Prepare the runner script of a trial and return its path.
    async fn create_runner(&self, trial: &TrialRecord) -> JobResult<PathBuf>;

    async fn runner_exists(&self, trial_id: TrialId) -> JobResult<bool>;

    /// Start the trial's command. A stale run of the same trial is killed first.
    async fn submit(&self, trial: &TrialRecord) -> JobResult<()>;

    async fn is_active(&self, trial_id: TrialId) -> JobResult<bool>;

    async fn kill(&self, trial_id: TrialId) -> JobResult<()>;

    /// Refresh the backend's view of running jobs. Called once per scheduler tick.
    async fn poll_status(&self) -> JobResult<()>;
}

/// Build the command line of one trial:
/// `<job_command> --<name>=<value>... --trial_id=<id> --config=<path>`.
pub fn trial_command_line(job_command: &str, trial: &TrialRecord, config_path: &Path) -> Vec<String> {
    let mut args: Vec<String> = job_command.split_whitespace().map(str::to_string).collect();
    args.extend(trial.parameters.iter().map(|p| p.to_arg()));
    args.push(format!("--trial_id={}", trial.trial_id));
    args.push(format!("--config={}", config_path.display()));
    args
}

/// Quote one argument for a POSIX shell script.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Select the backend configured by `resource.type`.
pub fn from_config(
    config: &HpgridConfig,
    config_path: &Path,
    workspace: Workspace,
    store: TrialStore,
) -> JobResult<Arc<dyn JobBackend>> {
    let backend: Arc<dyn JobBackend> = match (config.resource.kind, &config.abci) {
        (ResourceType::Abci, Some(abci)) => Arc::new(AbciBackend::new(
            abci.clone(),
            config.generic.job_command.clone(),
            config_path.to_path_buf(),
            workspace,
        )?),
        _ => Arc::new(LocalBackend::new(
            config.generic.job_command.clone(),
            config_path.to_path_buf(),
            workspace,
            store,
        )),
    };
    Ok(backend)
}
