//! hpgrid: distributed hyperparameter optimization driver.
//!
//! One binary plays every role of a run:
//! - `start` runs the master, which launches the optimizer and scheduler
//! - `optimizer` / `scheduler` are the child processes the master spawns
//! - `set-result` reports a trial outcome from a batch job
//! - `cancel` and `status` inspect or steer a live run through the store
//!
//! # Usage
//!
//! ```text
//! hpgrid start --config hpgrid.toml
//! hpgrid start --config hpgrid.toml --resume 7
//! hpgrid cancel --config hpgrid.toml --trial-id 3
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use hpgrid_core::{HpgridConfig, Module, TrialId, Workspace, epoch_secs, run_module};
use hpgrid_job::report::{parse_objective, read_error_text, record_result};
use hpgrid_master::{Master, ModuleLauncher, ProcessLauncher, TaskLauncher, prepare_resume};
use hpgrid_optimizer::Optimizer;
use hpgrid_scheduler::Scheduler;
use hpgrid_state::{TrialResult, TrialStore};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "hpgrid", about = "Distributed hyperparameter optimization driver")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a run: the master plus its optimizer and scheduler.
    Start {
        #[arg(long)]
        config: PathBuf,

        /// Continue an existing workspace after this trial id.
        #[arg(long, conflicts_with = "clean")]
        resume: Option<TrialId>,

        /// Delete an existing workspace before starting.
        #[arg(long)]
        clean: bool,

        /// Run the optimizer and scheduler as tasks of this process.
        #[arg(long)]
        in_process: bool,
    },

    /// Run the optimizer process (launched by the master).
    #[command(hide = true)]
    Optimizer {
        #[arg(long)]
        config: PathBuf,
    },

    /// Run the scheduler process (launched by the master).
    #[command(hide = true)]
    Scheduler {
        #[arg(long)]
        config: PathBuf,
    },

    /// Store the outcome of a trial command (used by batch job scripts).
    SetResult {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        trial_id: TrialId,
        #[arg(long)]
        start_time: Option<String>,
        #[arg(long)]
        end_time: Option<String>,
        #[arg(long)]
        exit_status: Option<String>,
        /// Last non-empty stdout line of the trial command.
        #[arg(long)]
        objective: Option<String>,
        #[arg(long)]
        error_file: Option<PathBuf>,
    },

    /// Ask the scheduler to cancel a trial; it goes back to ready.
    Cancel {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        trial_id: TrialId,
    },

    /// Print the trial counts of a run.
    Status {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hpgrid=debug"));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Command::Start {
            config,
            resume,
            clean,
            in_process,
        } => start(&config, resume, clean, in_process).await,
        Command::Optimizer { config } => {
            let (_, config) = load_config(&config)?;
            let store = open_store(&config)?;
            let mut optimizer = Optimizer::new(config, store)?;
            run_until_done(&mut optimizer).await
        }
        Command::Scheduler { config } => {
            let (config_path, config) = load_config(&config)?;
            let store = open_store(&config)?;
            let mut scheduler = Scheduler::new(config, &config_path, store)?;
            run_until_done(&mut scheduler).await
        }
        Command::SetResult {
            config,
            trial_id,
            start_time,
            end_time,
            exit_status,
            objective,
            error_file,
        } => {
            let (_, config) = load_config(&config)?;
            let store = open_store(&config)?;
            let result = batch_result(
                start_time.as_deref(),
                end_time.as_deref(),
                exit_status.as_deref(),
                objective.as_deref(),
                error_file.as_deref(),
            );
            record_result(&store, trial_id, result)?;
            Ok(())
        }
        Command::Cancel { config, trial_id } => {
            let (_, config) = load_config(&config)?;
            let store = open_store(&config)?;
            store.request_cancel(trial_id)?;
            info!(trial_id, "cancel requested");
            Ok(())
        }
        Command::Status { config, json } => {
            let (_, config) = load_config(&config)?;
            let store = open_store(&config)?;
            print_status(&config, &store, json)
        }
    }
}

/// Read and validate the config. Returns its absolute path too, since
/// child processes and job scripts receive it.
fn load_config(path: &Path) -> anyhow::Result<(PathBuf, HpgridConfig)> {
    let config_path = std::fs::canonicalize(path)
        .with_context(|| format!("config file not found: {}", path.display()))?;
    let config = HpgridConfig::from_file(&config_path)?;
    Ok((config_path, config))
}

fn workspace_of(config: &HpgridConfig) -> Workspace {
    Workspace::new(&config.generic.workspace, config.generic.name_length)
}

fn open_store(config: &HpgridConfig) -> anyhow::Result<TrialStore> {
    let path = workspace_of(config).storage_file();
    let store = TrialStore::open(&path)
        .with_context(|| format!("cannot open trial store {}", path.display()))?;
    Ok(store)
}

async fn start(
    config: &Path,
    resume: Option<TrialId>,
    clean: bool,
    in_process: bool,
) -> anyhow::Result<()> {
    let (config_path, config) = load_config(config)?;
    let workspace = workspace_of(&config);

    if workspace.exists() {
        if clean {
            info!(path = %workspace.root().display(), "removing existing workspace");
            workspace.clean()?;
        } else if resume.is_none() {
            bail!(
                "workspace {} already exists; pass --clean to start over or --resume <trial_id> to continue",
                workspace.root().display()
            );
        }
    } else if let Some(trial_id) = resume {
        bail!(
            "cannot resume from trial {trial_id}: workspace {} does not exist",
            workspace.root().display()
        );
    }
    workspace.create()?;

    let store = open_store(&config)?;
    if let Some(trial_id) = resume {
        prepare_resume(&store, trial_id)?;
    }

    let launcher: Box<dyn ModuleLauncher> = if in_process {
        Box::new(TaskLauncher::new(config.clone(), config_path, store.clone()))
    } else {
        Box::new(ProcessLauncher::current_exe(config_path)?)
    };

    info!(workspace = %workspace.root().display(), "hpgrid run starting");
    let mut master = Master::new(config, store, launcher)?;
    run_until_done(&mut master).await?;
    info!("hpgrid run finished");
    Ok(())
}

/// Run a module, stopping it cleanly on Ctrl-C.
async fn run_until_done<M>(module: &mut M) -> anyhow::Result<()>
where
    M: Module,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let role = module.role();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(%role, "shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });
    run_module(module, shutdown_rx)
        .await
        .with_context(|| format!("{role} failed"))?;
    Ok(())
}

/// Build a trial result from the values a batch script collected.
fn batch_result(
    start_time: Option<&str>,
    end_time: Option<&str>,
    exit_status: Option<&str>,
    objective: Option<&str>,
    error_file: Option<&Path>,
) -> TrialResult {
    let parse_time = |s: Option<&str>| s.and_then(|s| s.trim().parse::<u64>().ok());
    let exit_status = exit_status.and_then(|s| s.trim().parse::<i32>().ok());
    let objective = objective.and_then(parse_objective);
    let error = error_file.and_then(read_error_text).or_else(|| {
        exit_status
            .filter(|code| *code != 0)
            .map(|code| format!("process exited with status {code}"))
    });
    if objective.is_none() {
        warn!(?exit_status, "batch job reported no objective");
    }
    TrialResult {
        objective,
        error,
        start_time: parse_time(start_time),
        end_time: parse_time(end_time).or_else(|| Some(epoch_secs())),
        exit_status,
    }
}

fn print_status(config: &HpgridConfig, store: &TrialStore, json: bool) -> anyhow::Result<()> {
    let progress = hpgrid_job::progress(store)?;
    let total = config.optimize.trial_number;
    if json {
        let value = serde_json::json!({
            "trial_number": total,
            "created": progress.total(),
            "ready": progress.ready,
            "running": progress.running,
            "finished": progress.finished,
            "failed": progress.failed,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!(
            "finished {}/{}  created {}  ready {}  running {}  failed {}",
            progress.finished,
            total,
            progress.total(),
            progress.ready,
            progress.running,
            progress.failed
        );
        for (trial_id, jobstate) in store.list_jobstates()? {
            println!("  trial {trial_id}: {jobstate}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_start_flags() {
        let cli = Cli::try_parse_from([
            "hpgrid", "start", "--config", "hpgrid.toml", "--resume", "7", "--in-process",
        ])
        .unwrap();
        match cli.command {
            Command::Start {
                resume, in_process, clean, ..
            } => {
                assert_eq!(resume, Some(7));
                assert!(in_process);
                assert!(!clean);
            }
            _ => panic!("expected start"),
        }
        assert!(
            Cli::try_parse_from([
                "hpgrid", "start", "--config", "c.toml", "--resume", "1", "--clean"
            ])
            .is_err()
        );
    }

    #[test]
    fn batch_result_from_script_values() {
        let dir = tempfile::tempdir().unwrap();
        let error_file = dir.path().join("err.txt");
        std::fs::write(&error_file, "").unwrap();

        let ok = batch_result(
            Some("100"),
            Some("160"),
            Some("0"),
            Some("0.5"),
            Some(&error_file),
        );
        assert_eq!(ok.objective, Some(vec![0.5]));
        assert_eq!(ok.start_time, Some(100));
        assert_eq!(ok.end_time, Some(160));
        assert_eq!(ok.error, None);

        let failed = batch_result(Some("100"), Some(""), Some("2"), Some(""), None);
        assert_eq!(failed.objective, None);
        assert_eq!(failed.exit_status, Some(2));
        assert_eq!(failed.error.as_deref(), Some("process exited with status 2"));
        assert!(failed.end_time.is_some());

        std::fs::write(&error_file, "Traceback\n").unwrap();
        let with_error = batch_result(None, None, Some("1"), None, Some(&error_file));
        assert_eq!(with_error.error.as_deref(), Some("Traceback"));
    }
}
