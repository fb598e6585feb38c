//! Starting the optimizer and scheduler.
//!
//! Production runs launch each as its own OS process by re-executing the
//! current binary with the role's subcommand. [`TaskLauncher`] runs them as
//! tokio tasks in the master's own process instead; they still talk to
//! the master only through the trial store.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use hpgrid_core::{HpgridConfig, Role, run_module};
use hpgrid_optimizer::Optimizer;
use hpgrid_scheduler::Scheduler;
use hpgrid_state::TrialStore;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{MasterError, MasterResult};

/// How a child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    pub success: bool,
    pub detail: String,
}

#[async_trait]
pub trait ModuleChild: Send {
    fn role(&self) -> Role;

    /// `Some` once the child has exited. Never waits for a running child.
    async fn try_exit(&mut self) -> MasterResult<Option<ChildExit>>;

    /// Wait up to `timeout` for the child to exit on its own.
    async fn wait(&mut self, timeout: Duration) -> Option<ChildExit>;

    /// Stop the child now.
    async fn terminate(&mut self);
}

#[async_trait]
pub trait ModuleLauncher: Send + Sync {
    async fn launch(&self, role: Role) -> MasterResult<Box<dyn ModuleChild>>;
}

// ── OS processes ──────────────────────────────────────────────────

/// Runs `<exe> <role> --config <path>` for each child.
pub struct ProcessLauncher {
    exe: PathBuf,
    config_path: PathBuf,
}

impl ProcessLauncher {
    pub fn new(exe: PathBuf, config_path: PathBuf) -> Self {
        Self { exe, config_path }
    }

    /// Launch children from the running binary.
    pub fn current_exe(config_path: PathBuf) -> MasterResult<Self> {
        let exe = std::env::current_exe().map_err(|source| MasterError::Launch {
            role: Role::Master,
            source,
        })?;
        Ok(Self::new(exe, config_path))
    }
}

#[async_trait]
impl ModuleLauncher for ProcessLauncher {
    async fn launch(&self, role: Role) -> MasterResult<Box<dyn ModuleChild>> {
        let child = Command::new(&self.exe)
            .arg(role.as_str())
            .arg("--config")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MasterError::Launch { role, source })?;
        info!(%role, pid = child.id(), "child process launched");
        Ok(Box::new(ProcessChild { role, child }))
    }
}

struct ProcessChild {
    role: Role,
    child: Child,
}

fn process_exit(status: std::process::ExitStatus) -> ChildExit {
    ChildExit {
        success: status.success(),
        detail: format!("process {status}"),
    }
}

#[async_trait]
impl ModuleChild for ProcessChild {
    fn role(&self) -> Role {
        self.role
    }

    async fn try_exit(&mut self) -> MasterResult<Option<ChildExit>> {
        let status = self.child.try_wait().map_err(|source| MasterError::Launch {
            role: self.role,
            source,
        })?;
        Ok(status.map(process_exit))
    }

    async fn wait(&mut self, timeout: Duration) -> Option<ChildExit> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(process_exit(status)),
            Ok(Err(e)) => {
                warn!(role = %self.role, error = %e, "failed to wait for child");
                None
            }
            Err(_) => None,
        }
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(role = %self.role, error = %e, "failed to kill child");
        }
    }
}

// ── In-process tasks ──────────────────────────────────────────────

/// Runs the optimizer and scheduler modules as tasks of this process.
pub struct TaskLauncher {
    config: HpgridConfig,
    config_path: PathBuf,
    store: TrialStore,
}

impl TaskLauncher {
    pub fn new(config: HpgridConfig, config_path: PathBuf, store: TrialStore) -> Self {
        Self {
            config,
            config_path,
            store,
        }
    }
}

#[async_trait]
impl ModuleLauncher for TaskLauncher {
    async fn launch(&self, role: Role) -> MasterResult<Box<dyn ModuleChild>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = self.config.clone();
        let store = self.store.clone();
        let handle: JoinHandle<Result<(), String>> = match role {
            Role::Optimizer => {
                let mut module = Optimizer::new(config, store)?;
                tokio::spawn(async move {
                    run_module(&mut module, shutdown_rx)
                        .await
                        .map_err(|e| e.to_string())
                })
            }
            Role::Scheduler => {
                let mut module = Scheduler::new(config, &self.config_path, store)?;
                tokio::spawn(async move {
                    run_module(&mut module, shutdown_rx)
                        .await
                        .map_err(|e| e.to_string())
                })
            }
            Role::Master => {
                return Err(MasterError::Launch {
                    role,
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "the master is not a child role",
                    ),
                });
            }
        };
        info!(%role, "child task launched");
        Ok(Box::new(TaskChild {
            role,
            handle: Some(handle),
            shutdown_tx,
        }))
    }
}

struct TaskChild {
    role: Role,
    handle: Option<JoinHandle<Result<(), String>>>,
    shutdown_tx: watch::Sender<bool>,
}

fn task_exit(joined: Result<Result<(), String>, tokio::task::JoinError>) -> ChildExit {
    match joined {
        Ok(Ok(())) => ChildExit {
            success: true,
            detail: "task finished".into(),
        },
        Ok(Err(e)) => ChildExit {
            success: false,
            detail: e,
        },
        Err(e) => ChildExit {
            success: false,
            detail: format!("task panicked: {e}"),
        },
    }
}

#[async_trait]
impl ModuleChild for TaskChild {
    fn role(&self) -> Role {
        self.role
    }

    async fn try_exit(&mut self) -> MasterResult<Option<ChildExit>> {
        match self.handle.take() {
            Some(handle) if handle.is_finished() => Ok(Some(task_exit(handle.await))),
            Some(handle) => {
                self.handle = Some(handle);
                Ok(None)
            }
            None => Ok(Some(reaped())),
        }
    }

    async fn wait(&mut self, timeout: Duration) -> Option<ChildExit> {
        let Some(handle) = self.handle.as_mut() else {
            return Some(reaped());
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(joined) => {
                self.handle = None;
                Some(task_exit(joined))
            }
            Err(_) => None,
        }
    }

    async fn terminate(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if self.wait(Duration::from_secs(5)).await.is_none() {
            if let Some(handle) = self.handle.take() {
                handle.abort();
            }
        }
    }
}

/// A task whose exit was already collected by an earlier check.
fn reaped() -> ChildExit {
    ChildExit {
        success: true,
        detail: "task already reaped".into(),
    }
}
