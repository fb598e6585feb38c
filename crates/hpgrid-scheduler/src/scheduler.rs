//! Scheduler: packs trial jobs onto the execution slots.
//!
//! The scheduler process owns one [`JobHandle`] per in-flight trial.
//! Every tick it:
//!
//! 1. refreshes the backend's view of running jobs
//! 2. forwards cancel requests from the store to tracked jobs
//! 3. starts a job for every ready trial it does not track yet
//! 4. lets the scheduling policy start waiting jobs on free slots
//! 5. drops jobs that finished or handed their trial back to ready
//! 6. reports new job failures with the config keys behind them
//! 7. stops once the trial budget is finished or failed and no job
//!    still holds a slot
//!
//! `available_resource` is derived from the job handles on every tick and
//! written only by this loop.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hpgrid_core::{HpgridConfig, Module, Role, TrialId, TrialState, Workspace};
use hpgrid_job::{JobBackend, JobContext, JobHandle, JobState, progress};
use hpgrid_state::{TrialRecord, TrialStore};
use tracing::{debug, error, info, warn};

use crate::algorithm::{self, JobCandidate, SchedulingAlgorithm};
use crate::error::{SchedulerError, SchedulerResult};
use crate::verification::Verification;

pub struct Scheduler {
    config: Arc<HpgridConfig>,
    store: TrialStore,
    ctx: JobContext,
    algorithm: Box<dyn SchedulingAlgorithm>,
    verification: Option<Verification>,
    /// Tracked jobs, keyed by trial id.
    jobs: BTreeMap<TrialId, JobHandle>,
    max_resource: usize,
    available_resource: usize,
    /// Failures already reported by `check_error`.
    reported_failures: HashSet<TrialId>,
    /// Budget reached; only waiting for slot-holding jobs to settle.
    draining: bool,
}

impl Scheduler {
    /// Build a scheduler with the backend selected by `resource.type`.
    pub fn new(config: HpgridConfig, config_path: &Path, store: TrialStore) -> SchedulerResult<Self> {
        let workspace = Workspace::new(&config.generic.workspace, config.generic.name_length);
        let backend =
            hpgrid_job::backend::from_config(&config, config_path, workspace, store.clone())?;
        Self::with_backend(config, store, backend)
    }

    pub fn with_backend(
        config: HpgridConfig,
        store: TrialStore,
        backend: Arc<dyn JobBackend>,
    ) -> SchedulerResult<Self> {
        let workspace = Workspace::new(&config.generic.workspace, config.generic.name_length);
        let algorithm = algorithm::from_name(&config.job.scheduling, config.optimize.rand_seed)?;
        let verification = Verification::from_config(&config, workspace.clone())?;
        let ctx = JobContext::new(store.clone(), backend, workspace, config.job.clone());
        let max_resource = config.max_resource();
        Ok(Self {
            config: Arc::new(config),
            store,
            ctx,
            algorithm,
            verification,
            jobs: BTreeMap::new(),
            max_resource,
            available_resource: max_resource,
            reported_failures: HashSet::new(),
            draining: false,
        })
    }

    pub fn available_resource(&self) -> usize {
        self.available_resource
    }

    pub fn tracked_trials(&self) -> Vec<TrialId> {
        self.jobs.keys().copied().collect()
    }

    pub fn job_state(&self, trial_id: TrialId) -> Option<JobState> {
        self.jobs.get(&trial_id).map(JobHandle::state)
    }

    /// Spawn a job for `trial_id` starting at `start`.
    pub fn start_job(&mut self, trial_id: TrialId, start: JobState) -> SchedulerResult<()> {
        if self.jobs.contains_key(&trial_id) {
            return Err(SchedulerError::AlreadyTracked(trial_id));
        }
        let handle = JobHandle::spawn(trial_id, start, self.ctx.clone());
        self.jobs.insert(trial_id, handle);
        debug!(trial_id, %start, "job tracked");
        Ok(())
    }

    /// Re-attach trials a previous scheduler left running. They restart at
    /// `Scheduling` and are resubmitted once a slot frees up.
    fn reattach_running(&mut self) -> SchedulerResult<()> {
        for trial in self.store.list_by_state(TrialState::Running)? {
            info!(trial_id = trial.trial_id, "re-attaching running trial");
            if let Err(e) = self.start_job(trial.trial_id, JobState::Scheduling) {
                error!(trial_id = trial.trial_id, error = %e, "cannot re-attach trial");
            }
        }
        Ok(())
    }

    async fn poll_backend(&self) {
        if let Err(e) = self.ctx.backend.poll_status().await {
            warn!(error = %e, "job status poll failed");
        }
    }

    fn forward_cancels(&self) -> SchedulerResult<()> {
        for trial_id in self.store.take_cancel_requests()? {
            match self.jobs.get(&trial_id) {
                Some(handle) => {
                    info!(trial_id, state = %handle.state(), "forwarding cancel request");
                    handle.cancel();
                }
                None => warn!(trial_id, "cancel requested for untracked trial, ignoring"),
            }
        }
        Ok(())
    }

    fn dispatch_ready(&mut self) -> SchedulerResult<()> {
        for trial in self.store.list_by_state(TrialState::Ready)? {
            if self.jobs.contains_key(&trial.trial_id) || has_failed(&trial) {
                continue;
            }
            if let Err(e) = self.start_job(trial.trial_id, JobState::Init) {
                error!(trial_id = trial.trial_id, error = %e, "skipping trial");
            }
        }
        Ok(())
    }

    fn schedule_waiting(&mut self) {
        self.recompute_available();
        let candidates: Vec<JobCandidate> = self
            .jobs
            .values()
            .filter(|h| h.state() == JobState::Scheduling && !h.is_scheduled())
            .map(|h| JobCandidate {
                trial_id: h.trial_id(),
            })
            .collect();
        if candidates.is_empty() || self.available_resource == 0 {
            return;
        }

        let selected = self.algorithm.select(&candidates, self.available_resource);
        for trial_id in selected.into_iter().take(self.available_resource) {
            if let Some(handle) = self.jobs.get_mut(&trial_id) {
                handle.schedule();
                debug!(trial_id, algorithm = self.algorithm.name(), "job scheduled");
            }
        }
        self.recompute_available();
    }

    fn recompute_available(&mut self) {
        let occupied = self.jobs.values().filter(|h| h.occupies_slot()).count();
        self.available_resource = self.max_resource.saturating_sub(occupied);
    }

    /// Drop handles whose job succeeded or handed its trial back to ready.
    /// Failed jobs stay tracked so their trial is not dispatched again.
    async fn reap_jobs(&mut self) {
        let done: Vec<TrialId> = self
            .jobs
            .iter()
            .filter(|(_, h)| {
                matches!(
                    h.state(),
                    JobState::Success | JobState::Canceled | JobState::HpExpired
                ) && h.is_finished()
            })
            .map(|(id, _)| *id)
            .collect();
        for trial_id in done {
            if let Some(handle) = self.jobs.remove(&trial_id) {
                debug!(trial_id, state = %handle.state(), "job released");
                handle.join().await;
            }
        }
    }

    fn report_failures(&mut self) {
        for (trial_id, handle) in &self.jobs {
            let state = handle.state();
            if !state.is_failure() || !self.reported_failures.insert(*trial_id) {
                continue;
            }
            match state.phase() {
                Some(phase) => error!(
                    trial_id = *trial_id,
                    %state,
                    "job failed; check {0}.timeout and {0}.retry",
                    phase.config_key()
                ),
                None => error!(trial_id = *trial_id, %state, "job failed"),
            }
        }
    }

    fn run_verification(&self) {
        if let Some(verification) = &self.verification {
            if let Err(e) = verification.run(&self.store) {
                warn!(error = %e, "verification failed to run");
            }
        }
    }

    async fn shutdown_jobs(&mut self) {
        for handle in self.jobs.values() {
            handle.stop();
        }
        let jobs = std::mem::take(&mut self.jobs);
        let count = jobs.len();
        for (_, handle) in jobs {
            handle.join().await;
        }
        debug!(count, "jobs stopped");
    }
}

/// Whether the trial's last job ended in a terminal failure.
fn has_failed(trial: &TrialRecord) -> bool {
    trial
        .jobstate
        .as_deref()
        .and_then(JobState::from_name)
        .is_some_and(|s| s.is_failure())
}

#[async_trait]
impl Module for Scheduler {
    type Error = SchedulerError;

    fn role(&self) -> Role {
        Role::Scheduler
    }

    fn loop_interval(&self) -> Duration {
        self.config.generic.sleep_time
    }

    async fn pre_process(&mut self) -> SchedulerResult<()> {
        self.store.set_liveness(Role::Scheduler, true)?;
        self.reattach_running()?;
        info!(
            max_resource = self.max_resource,
            algorithm = self.algorithm.name(),
            reattached = self.jobs.len(),
            "scheduler ready"
        );
        Ok(())
    }

    async fn inner_loop_pre_process(&mut self) -> SchedulerResult<bool> {
        self.poll_backend().await;
        self.forward_cancels()?;
        Ok(true)
    }

    async fn inner_loop_main_process(&mut self) -> SchedulerResult<bool> {
        if self.draining {
            return Ok(true);
        }
        self.dispatch_ready()?;
        self.schedule_waiting();
        Ok(true)
    }

    async fn inner_loop_post_process(&mut self) -> SchedulerResult<bool> {
        self.reap_jobs().await;
        self.recompute_available();
        self.run_verification();
        Ok(true)
    }

    async fn check_error(&mut self) -> SchedulerResult<bool> {
        self.report_failures();

        let progress = progress(&self.store)?;
        if progress.done() >= self.config.optimize.trial_number {
            let settling = self.jobs.values().filter(|h| h.occupies_slot()).count();
            if settling > 0 {
                if !self.draining {
                    debug!(settling, "trial budget reached, waiting for jobs to settle");
                }
                self.draining = true;
                return Ok(true);
            }
            info!(
                finished = progress.finished,
                failed = progress.failed,
                "trial budget reached"
            );
            return Ok(false);
        }
        debug!(
            tracked = self.jobs.len(),
            available = self.available_resource,
            "scheduler tick"
        );
        Ok(true)
    }

    async fn post_process(&mut self) -> SchedulerResult<()> {
        self.shutdown_jobs().await;
        self.run_verification();
        self.store.set_liveness(Role::Scheduler, false)?;
        Ok(())
    }

    async fn on_abort(&mut self) {
        self.shutdown_jobs().await;
        if let Err(e) = self.store.set_liveness(Role::Scheduler, false) {
            warn!(error = %e, "failed to clear scheduler liveness");
        }
    }
}
