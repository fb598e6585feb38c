//! Job: one tokio task driving one trial through the state machine.
//!
//! The task polls every `job.loop_duration` and fires at most one
//! transition per tick. The scheduler talks to it only through a
//! [`JobHandle`]: it reads the current state, asks it to schedule or
//! cancel, and stops it on shutdown.

use std::sync::Arc;

use hpgrid_core::config::JobConfig;
use hpgrid_core::{TrialId, TrialState, Workspace};
use hpgrid_state::{TrialRecord, TrialStore};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::artifact::write_artifact;
use crate::backend::JobBackend;
use crate::error::{JobError, JobResult};
use crate::state::{JobState, Trigger};
use crate::transitions::{Action, Guard, TransitionTable};

/// Everything a job needs besides its own state; shared by all jobs of a scheduler.
#[derive(Clone)]
pub struct JobContext {
    pub store: TrialStore,
    pub backend: Arc<dyn JobBackend>,
    pub workspace: Workspace,
    pub config: Arc<JobConfig>,
    pub table: Arc<TransitionTable>,
    /// Serializes job-side read-modify-write updates of the store.
    pub store_lock: Arc<Mutex<()>>,
}

impl JobContext {
    pub fn new(
        store: TrialStore,
        backend: Arc<dyn JobBackend>,
        workspace: Workspace,
        config: JobConfig,
    ) -> Self {
        Self {
            store,
            backend,
            workspace,
            config: Arc::new(config),
            table: Arc::new(TransitionTable::new()),
            store_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobCommand {
    Schedule,
    Cancel,
}

/// Scheduler-side handle of a running job task.
pub struct JobHandle {
    trial_id: TrialId,
    state_rx: watch::Receiver<JobState>,
    commands: mpsc::UnboundedSender<JobCommand>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    scheduled: bool,
}

impl JobHandle {
    /// Spawn a job task for `trial_id` starting at `start`
    /// (`Init` for new trials, `Scheduling` when re-attaching a running trial).
    pub fn spawn(trial_id: TrialId, start: JobState, ctx: JobContext) -> Self {
        let (state_tx, state_rx) = watch::channel(start);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let job = Job {
            trial_id,
            state: start,
            ctx,
            deadline: None,
            count_retry: 0,
            threshold_retry: 0,
            schedule_pending: false,
            cancel_pending: false,
            expire_exhausted: false,
            state_tx,
        };
        let task = tokio::spawn(job.run(command_rx, shutdown_rx));

        Self {
            trial_id,
            state_rx,
            commands,
            shutdown_tx,
            task,
            scheduled: false,
        }
    }

    pub fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    pub fn state(&self) -> JobState {
        *self.state_rx.borrow()
    }

    /// Let the job leave `Scheduling` and start consuming a slot.
    pub fn schedule(&mut self) {
        if self.commands.send(JobCommand::Schedule).is_ok() {
            self.scheduled = true;
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    /// Whether this job counts against the resource pool.
    ///
    /// A job that was scheduled but has not yet left `Scheduling` already
    /// holds its slot.
    pub fn occupies_slot(&self) -> bool {
        let state = self.state();
        state.occupies_slot() || (self.scheduled && state == JobState::Scheduling)
    }

    /// Request soft cancellation: the job kills its run and returns the trial to Ready.
    pub fn cancel(&self) {
        let _ = self.commands.send(JobCommand::Cancel);
    }

    /// Ask the task to exit at its next loop iteration.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(trial_id = self.trial_id, error = %e, "job task panicked");
        }
    }
}

struct Job {
    trial_id: TrialId,
    state: JobState,
    ctx: JobContext,
    deadline: Option<Instant>,
    count_retry: u32,
    threshold_retry: u32,
    schedule_pending: bool,
    cancel_pending: bool,
    /// The trial has expired more often than `expire.retry` allows.
    expire_exhausted: bool,
    state_tx: watch::Sender<JobState>,
}

impl Job {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<JobCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let trial_id = self.trial_id;
        info!(trial_id, state = %self.state, "job started");
        self.persist_state().await;

        loop {
            if *shutdown.borrow() {
                debug!(trial_id, state = %self.state, "job stopped");
                break;
            }
            while let Ok(command) = commands.try_recv() {
                match command {
                    JobCommand::Schedule => self.schedule_pending = true,
                    JobCommand::Cancel => self.cancel_pending = true,
                }
            }

            self.step().await;

            if self.state.is_terminal() {
                if self.state.is_failure() {
                    error!(trial_id, state = %self.state, "job failed");
                    self.release_backend().await;
                } else {
                    info!(trial_id, state = %self.state, "job finished");
                }
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.loop_duration) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!(trial_id, "job handle dropped");
                        break;
                    }
                }
            }
        }
    }

    /// Choose the single trigger attempted on this tick.
    fn pick_trigger(&mut self) -> Trigger {
        if self.cancel_pending {
            if self.state.accepts_cancel() {
                return Trigger::Cancel;
            }
            debug!(trial_id = self.trial_id, state = %self.state, "cancel ignored");
            self.cancel_pending = false;
        }
        if self.state == JobState::Scheduling && self.schedule_pending {
            return Trigger::Schedule;
        }
        if self.state == JobState::HpExpireConfirmed && self.expire_exhausted {
            return Trigger::Expire;
        }
        if self.state.has_deadline() && self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Trigger::Expire;
        }
        if self.state.is_failed() && self.count_retry >= self.threshold_retry {
            return Trigger::Expire;
        }
        Trigger::Next
    }

    /// Attempt one transition. Returns whether the state changed.
    async fn step(&mut self) -> bool {
        let trigger = self.pick_trigger();
        let Some(spec) = self.ctx.table.get(self.state, trigger).copied() else {
            return false;
        };

        if let Some(guard) = spec.guard {
            match self.check_guard(guard).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    warn!(trial_id = self.trial_id, state = %self.state, ?guard, error = %e, "guard check failed");
                    return false;
                }
            }
        }

        if let Some(action) = spec.action {
            if let Err(e) = self.run_action(action).await {
                warn!(trial_id = self.trial_id, state = %self.state, ?action, error = %e, "action failed");
                return false;
            }
        }

        match trigger {
            Trigger::Cancel => self.cancel_pending = false,
            Trigger::Schedule => self.schedule_pending = false,
            Trigger::Next | Trigger::Expire => {}
        }
        self.enter(spec.next).await;
        true
    }

    async fn enter(&mut self, next: JobState) {
        let prev = std::mem::replace(&mut self.state, next);

        if next.stamps_deadline() {
            if let Some(phase) = next.phase() {
                let budget = phase.budget(&self.ctx.config);
                self.deadline = Some(Instant::now() + budget.timeout);
                let retrying = prev.is_failed() && prev.phase() == Some(phase);
                if !retrying {
                    self.count_retry = 0;
                    self.threshold_retry = budget.retry;
                }
            }
        }
        if next.is_failed() {
            self.count_retry += 1;
            warn!(
                trial_id = self.trial_id,
                state = %next,
                count_retry = self.count_retry,
                threshold_retry = self.threshold_retry,
                "job phase failed"
            );
        }

        debug!(trial_id = self.trial_id, from = %prev, to = %next, "job transition");
        self.persist_state().await;
        self.state_tx.send_replace(next);
    }

    /// Kill a backend job left behind by a failed phase so its slot frees up.
    async fn release_backend(&self) {
        let id = self.trial_id;
        let backend = &self.ctx.backend;
        match backend.is_active(id).await {
            Ok(false) => {}
            Ok(true) => {
                if let Err(e) = backend.kill(id).await {
                    warn!(trial_id = id, error = %e, "failed to kill job of failed trial");
                } else {
                    info!(trial_id = id, "killed job of failed trial");
                }
            }
            Err(e) => warn!(trial_id = id, error = %e, "cannot query job of failed trial"),
        }
    }

    async fn persist_state(&self) {
        let _lock = self.ctx.store_lock.lock().await;
        if let Err(e) = self.ctx.store.set_jobstate(self.trial_id, self.state.name()) {
            warn!(trial_id = self.trial_id, error = %e, "failed to persist jobstate");
        }
    }

    fn load_trial(&self) -> JobResult<TrialRecord> {
        self.ctx
            .store
            .get_trial(self.trial_id)?
            .ok_or(JobError::TrialNotFound(self.trial_id))
    }

    async fn check_guard(&self, guard: Guard) -> JobResult<bool> {
        let id = self.trial_id;
        let store = &self.ctx.store;
        let backend = &self.ctx.backend;
        let holds = match guard {
            Guard::RunnerExists => backend.runner_exists(id).await?,
            Guard::StateIs(state) => store.get_state(id)? == state,
            Guard::CancelSettled => matches!(
                store.get_state(id)?,
                TrialState::Ready | TrialState::Finished
            ),
            Guard::JobDone => !backend.is_active(id).await? || store.get_result(id)?.is_some(),
            Guard::JobInactive => !backend.is_active(id).await?,
            Guard::HasObjective => store.get_objective(id)?.is_some(),
        };
        Ok(holds)
    }

    async fn run_action(&mut self, action: Action) -> JobResult<()> {
        let id = self.trial_id;
        let store = &self.ctx.store;
        let backend = &self.ctx.backend;
        match action {
            Action::CreateRunner => {
                let trial = self.load_trial()?;
                let path = backend.create_runner(&trial).await?;
                debug!(trial_id = id, ?path, "runner created");
            }
            Action::MarkRunning => {
                let _lock = self.ctx.store_lock.lock().await;
                store.set_state(id, TrialState::Running)?;
            }
            Action::Submit => {
                {
                    let _lock = self.ctx.store_lock.lock().await;
                    store.clear_result(id)?;
                }
                let trial = self.load_trial()?;
                backend.submit(&trial).await?;
            }
            Action::Finish => {
                let _lock = self.ctx.store_lock.lock().await;
                let trial = self.load_trial()?;
                write_artifact(&self.ctx.workspace, &trial)?;
                store.set_state(id, TrialState::Finished)?;
            }
            Action::Expire => {
                if backend.is_active(id).await? {
                    backend.kill(id).await?;
                }
                let _lock = self.ctx.store_lock.lock().await;
                let trial = self.load_trial()?;
                let count = if trial.state == TrialState::Ready {
                    trial.expire_count
                } else {
                    store.set_state(id, TrialState::Ready)?;
                    store.record_expiry(id)?
                };
                let limit = self.ctx.config.expire.retry;
                self.expire_exhausted = count > limit;
                if self.expire_exhausted {
                    warn!(trial_id = id, count, limit, "trial expired too often, giving up");
                } else {
                    info!(trial_id = id, count, "trial expired, returned to ready");
                }
            }
            Action::Kill => backend.kill(id).await?,
            Action::AfterCancel => {
                let _lock = self.ctx.store_lock.lock().await;
                let moved = store.compare_and_set_state(
                    id,
                    &[TrialState::Ready, TrialState::Running],
                    TrialState::Ready,
                )?;
                if moved {
                    info!(trial_id = id, "trial canceled, returned to ready");
                } else {
                    info!(trial_id = id, state = %store.get_state(id)?, "trial not ready or running, state left as is");
                }
            }
        }
        Ok(())
    }
}
