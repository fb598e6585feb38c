//! Master: supervises a run from launch to final evaluation.
//!
//! The master starts the optimizer and scheduler, waits until both report
//! alive, then watches progress every tick. A child that dies before the
//! trial budget is done aborts the run. When the budget is done the
//! master evaluates the finished trials, writes the final result and the
//! verification report, and waits for its children to exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hpgrid_core::{HpgridConfig, Module, Role, Workspace};
use hpgrid_job::{Progress, progress};
use hpgrid_scheduler::Verification;
use hpgrid_state::TrialStore;
use tracing::{error, info, warn};

use crate::error::{MasterError, MasterResult};
use crate::evaluator::{Evaluator, FinalResult};
use crate::launcher::{ModuleChild, ModuleLauncher};

/// Roles the master launches, in launch order.
pub const CHILD_ROLES: [Role; 2] = [Role::Optimizer, Role::Scheduler];

pub struct Master {
    config: Arc<HpgridConfig>,
    store: TrialStore,
    workspace: Workspace,
    launcher: Box<dyn ModuleLauncher>,
    children: Vec<Box<dyn ModuleChild>>,
    evaluator: Evaluator,
    verification: Option<Verification>,
    started_at: Instant,
    /// Finished count when the master started; resumed runs exclude it from the ETA.
    finished_at_start: u64,
    last_logged: Option<Progress>,
    final_result: Option<FinalResult>,
}

impl Master {
    pub fn new(
        config: HpgridConfig,
        store: TrialStore,
        launcher: Box<dyn ModuleLauncher>,
    ) -> MasterResult<Self> {
        let workspace = Workspace::new(&config.generic.workspace, config.generic.name_length);
        let evaluator = Evaluator::new(&config.optimize.goal)?;
        let verification = Verification::from_config(&config, workspace.clone())?;
        Ok(Self {
            config: Arc::new(config),
            store,
            workspace,
            launcher,
            children: Vec::new(),
            evaluator,
            verification,
            started_at: Instant::now(),
            finished_at_start: 0,
            last_logged: None,
            final_result: None,
        })
    }

    /// The evaluation written by `post_process`, once the run is over.
    pub fn final_result(&self) -> Option<&FinalResult> {
        self.final_result.as_ref()
    }

    fn trial_number(&self) -> u64 {
        self.config.optimize.trial_number
    }

    /// Poll liveness until every child is up or the poll limit runs out.
    async fn wait_for_startup(&mut self) -> MasterResult<()> {
        let limit = self.config.master.startup_failure_limit;
        for _ in 0..limit {
            let mut pending = Vec::new();
            for child in &mut self.children {
                let role = child.role();
                if self.store.is_alive(role)? {
                    continue;
                }
                match child.try_exit().await? {
                    // A child that already finished its work came up and left.
                    Some(exit) if exit.success => {}
                    Some(exit) => {
                        return Err(MasterError::ChildCrashed {
                            role,
                            reason: exit.detail,
                        });
                    }
                    None => pending.push(role),
                }
            }
            if pending.is_empty() {
                info!("all child modules are alive");
                return Ok(());
            }
            tokio::time::sleep(self.config.generic.sleep_time).await;
        }

        let mut roles = Vec::new();
        for child in &self.children {
            if !self.store.is_alive(child.role())? {
                roles.push(child.role());
            }
        }
        Err(MasterError::StartupFailed {
            roles,
            polls: limit,
        })
    }

    fn log_progress(&mut self, progress: Progress) {
        let total = self.trial_number();
        let done_now = progress.finished.saturating_sub(self.finished_at_start);
        let eta = (done_now > 0).then(|| {
            let per_trial = self.started_at.elapsed().as_secs_f64() / done_now as f64;
            let remaining = total.saturating_sub(progress.done());
            Duration::from_secs_f64(per_trial * remaining as f64)
        });
        if self.last_logged != Some(progress) {
            info!(
                finished = progress.finished,
                total,
                ready = progress.ready,
                running = progress.running,
                failed = progress.failed,
                eta_secs = ?eta.map(|d| d.as_secs()),
                "progress {}/{}",
                progress.finished,
                total
            );
            self.last_logged = Some(progress);
        }
    }

    /// A child that stopped is fatal unless the run is already done.
    async fn check_children(&mut self) -> MasterResult<bool> {
        for child in &mut self.children {
            let role = child.role();
            let exited = child.try_exit().await?;
            let alive = self.store.is_alive(role)?;
            if exited.is_none() && alive {
                continue;
            }
            if progress(&self.store)?.done() >= self.config.optimize.trial_number {
                return Ok(false);
            }
            let reason = match exited {
                Some(exit) => exit.detail,
                None => "liveness flag cleared".to_string(),
            };
            error!(%role, %reason, "child module stopped before the run finished");
            return Err(MasterError::ChildCrashed { role, reason });
        }
        Ok(true)
    }

    fn evaluate(&mut self) -> MasterResult<()> {
        let trials = self.store.list_trials()?;
        let result = self.evaluator.evaluate(&trials);
        self.evaluator.write(&self.workspace, &result)?;
        match result.best.as_slice() {
            [] => warn!("no finished trial produced an objective"),
            [best] => info!(
                trial_id = best.trial_id,
                objective = ?best.objective,
                "best trial"
            ),
            front => info!(size = front.len(), "pareto front"),
        }
        self.final_result = Some(result);
        Ok(())
    }

    fn verify(&self) -> MasterResult<()> {
        if let Some(verification) = &self.verification {
            verification.run(&self.store)?;
            verification.write_report(&self.store)?;
        }
        Ok(())
    }

    async fn wait_for_children(&mut self) {
        let timeout = self.config.master.shutdown_timeout;
        for child in &mut self.children {
            let role = child.role();
            match child.wait(timeout).await {
                Some(exit) if exit.success => info!(%role, "child exited"),
                Some(exit) => warn!(%role, detail = %exit.detail, "child exited with failure"),
                None => {
                    warn!(%role, ?timeout, "child did not exit in time, terminating");
                    child.terminate().await;
                }
            }
        }
    }
}

#[async_trait]
impl Module for Master {
    type Error = MasterError;

    fn role(&self) -> Role {
        Role::Master
    }

    fn loop_interval(&self) -> Duration {
        self.config.generic.sleep_time
    }

    async fn pre_process(&mut self) -> MasterResult<()> {
        self.store.set_liveness(Role::Master, true)?;
        self.workspace
            .create()
            .map_err(|source| MasterError::Io {
                path: self.workspace.root().to_path_buf(),
                source,
            })?;
        self.finished_at_start = progress(&self.store)?.finished;
        self.started_at = Instant::now();

        for role in CHILD_ROLES {
            let child = self.launcher.launch(role).await?;
            self.children.push(child);
        }
        self.wait_for_startup().await
    }

    async fn inner_loop_main_process(&mut self) -> MasterResult<bool> {
        let progress = progress(&self.store)?;
        self.log_progress(progress);
        if progress.done() >= self.trial_number() {
            info!(
                finished = progress.finished,
                failed = progress.failed,
                elapsed_secs = self.started_at.elapsed().as_secs(),
                "trial budget reached"
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn check_error(&mut self) -> MasterResult<bool> {
        self.check_children().await
    }

    async fn post_process(&mut self) -> MasterResult<()> {
        self.evaluate()?;
        self.verify()?;
        self.wait_for_children().await;
        self.store.set_liveness(Role::Master, false)?;
        Ok(())
    }

    async fn on_abort(&mut self) {
        for child in &mut self.children {
            child.terminate().await;
        }
        if let Err(e) = self.store.set_liveness(Role::Master, false) {
            warn!(error = %e, "failed to clear master liveness");
        }
    }
}
