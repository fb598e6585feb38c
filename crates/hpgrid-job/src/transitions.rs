//! The job transition table.
//!
//! Each `(state, trigger)` pair maps to an optional guard that must hold,
//! an optional action run as the transition's side effect, and the next
//! state. A phase follows the same ladder everywhere:
//!
//! ```text
//! XReady --next/action--> XChecking --next/guard--> XConfirmed --next--> ...
//!    |expire                 |expire
//!    +-------------------> XFailed --next--> XReady (retry)
//!                            |expire (retries exhausted)
//!                         XFailure
//! ```

use std::collections::HashMap;

use hpgrid_core::TrialState;

use crate::state::{JobState, Trigger};

/// Condition evaluated before a transition commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    RunnerExists,
    StateIs(TrialState),
    /// Stored state is Ready or Finished.
    CancelSettled,
    /// Job no longer active, or a result is already stored.
    JobDone,
    JobInactive,
    HasObjective,
}

/// Side effect run when a transition fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateRunner,
    MarkRunning,
    Submit,
    Finish,
    Expire,
    Kill,
    AfterCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionSpec {
    pub guard: Option<Guard>,
    pub action: Option<Action>,
    pub next: JobState,
}

#[derive(Debug, Clone)]
pub struct TransitionTable {
    table: HashMap<(JobState, Trigger), TransitionSpec>,
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionTable {
    pub fn new() -> Self {
        use JobState::*;

        let mut t = Self {
            table: HashMap::new(),
        };

        t.add(Init, Trigger::Next, None, None, RunnerReady);
        t.ladder(
            [RunnerReady, RunnerChecking, RunnerConfirmed, RunnerFailed, RunnerFailure],
            Action::CreateRunner,
            Guard::RunnerExists,
            Scheduling,
        );
        t.add(Scheduling, Trigger::Schedule, None, None, HpRunningReady);
        t.ladder(
            [
                HpRunningReady,
                HpRunningChecking,
                HpRunningConfirmed,
                HpRunningFailed,
                HpRunningFailure,
            ],
            Action::MarkRunning,
            Guard::StateIs(TrialState::Running),
            JobReady,
        );
        t.ladder(
            [JobReady, JobChecking, JobConfirmed, JobFailed, JobFailure],
            Action::Submit,
            Guard::JobDone,
            WaitResult,
        );
        t.add(WaitResult, Trigger::Next, Some(Guard::HasObjective), None, Result);
        t.add(WaitResult, Trigger::Expire, None, None, HpExpireReady);
        t.add(Result, Trigger::Next, None, None, HpFinishedReady);
        t.ladder(
            [
                HpFinishedReady,
                HpFinishedChecking,
                HpFinishedConfirmed,
                HpFinishedFailed,
                HpFinishedFailure,
            ],
            Action::Finish,
            Guard::StateIs(TrialState::Finished),
            Success,
        );
        t.ladder(
            [
                HpExpireReady,
                HpExpireChecking,
                HpExpireConfirmed,
                HpExpireFailed,
                HpExpireFailure,
            ],
            Action::Expire,
            Guard::StateIs(TrialState::Ready),
            HpExpired,
        );
        // Taken instead of the exit once the trial has used up its redispatches.
        t.add(HpExpireConfirmed, Trigger::Expire, None, None, HpExpireFailure);

        t.add(Canceling, Trigger::Next, None, None, KillReady);
        t.ladder(
            [KillReady, KillChecking, KillConfirmed, KillFailed, KillFailure],
            Action::Kill,
            Guard::JobInactive,
            HpCancelReady,
        );
        t.ladder(
            [
                HpCancelReady,
                HpCancelChecking,
                HpCancelConfirmed,
                HpCancelFailed,
                HpCancelFailure,
            ],
            Action::AfterCancel,
            Guard::CancelSettled,
            Canceled,
        );

        for state in JobState::ALL.into_iter().filter(JobState::accepts_cancel) {
            t.add(state, Trigger::Cancel, None, None, Canceling);
        }

        t
    }

    fn add(
        &mut self,
        from: JobState,
        trigger: Trigger,
        guard: Option<Guard>,
        action: Option<Action>,
        next: JobState,
    ) {
        self.table
            .insert((from, trigger), TransitionSpec { guard, action, next });
    }

    /// Register the Ready/Checking/Confirmed/Failed/Failure ladder of a phase.
    fn ladder(&mut self, states: [JobState; 5], action: Action, guard: Guard, exit: JobState) {
        let [ready, checking, confirmed, failed, failure] = states;
        self.add(ready, Trigger::Next, None, Some(action), checking);
        self.add(ready, Trigger::Expire, None, None, failed);
        self.add(checking, Trigger::Next, Some(guard), None, confirmed);
        self.add(checking, Trigger::Expire, None, None, failed);
        self.add(confirmed, Trigger::Next, None, None, exit);
        self.add(failed, Trigger::Next, None, None, ready);
        self.add(failed, Trigger::Expire, None, None, failure);
    }

    pub fn get(&self, state: JobState, trigger: Trigger) -> Option<&TransitionSpec> {
        self.table.get(&(state, trigger))
    }

    pub fn accepts(&self, state: JobState, trigger: Trigger) -> bool {
        self.table.contains_key(&(state, trigger))
    }
}
