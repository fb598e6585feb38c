//! Job states, triggers and execution phases.

use std::fmt;

use hpgrid_core::config::{JobConfig, PhaseBudget};

/// Fine-grained state of one trial's job state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Init,
    RunnerReady,
    RunnerChecking,
    RunnerConfirmed,
    RunnerFailed,
    RunnerFailure,
    Scheduling,
    HpRunningReady,
    HpRunningChecking,
    HpRunningConfirmed,
    HpRunningFailed,
    HpRunningFailure,
    JobReady,
    JobChecking,
    JobConfirmed,
    JobFailed,
    JobFailure,
    WaitResult,
    Result,
    HpFinishedReady,
    HpFinishedChecking,
    HpFinishedConfirmed,
    HpFinishedFailed,
    HpFinishedFailure,
    HpExpireReady,
    HpExpireChecking,
    HpExpireConfirmed,
    HpExpireFailed,
    HpExpireFailure,
    HpExpired,
    Canceling,
    KillReady,
    KillChecking,
    KillConfirmed,
    KillFailed,
    KillFailure,
    HpCancelReady,
    HpCancelChecking,
    HpCancelConfirmed,
    HpCancelFailed,
    HpCancelFailure,
    Canceled,
    Success,
}

/// Event fed into the state machine on a poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Next,
    Expire,
    Schedule,
    Cancel,
}

/// Timeout/retry budget group a state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Runner,
    Running,
    Job,
    Result,
    Finished,
    Kill,
    Cancel,
    Expire,
}

impl Phase {
    /// Configuration key of this phase under `[job]`.
    pub fn config_key(&self) -> &'static str {
        match self {
            Self::Runner => "job.runner",
            Self::Running => "job.running",
            Self::Job => "job.job",
            Self::Result => "job.result",
            Self::Finished => "job.finished",
            Self::Kill => "job.kill",
            Self::Cancel => "job.cancel",
            Self::Expire => "job.expire",
        }
    }

    pub fn budget(&self, config: &JobConfig) -> PhaseBudget {
        match self {
            Self::Runner => config.runner,
            Self::Running => config.running,
            Self::Job => config.job,
            Self::Result => config.result,
            Self::Finished => config.finished,
            Self::Kill => config.kill,
            Self::Cancel => config.cancel,
            Self::Expire => config.expire,
        }
    }
}

impl JobState {
    pub const ALL: [JobState; 43] = [
        Self::Init,
        Self::RunnerReady,
        Self::RunnerChecking,
        Self::RunnerConfirmed,
        Self::RunnerFailed,
        Self::RunnerFailure,
        Self::Scheduling,
        Self::HpRunningReady,
        Self::HpRunningChecking,
        Self::HpRunningConfirmed,
        Self::HpRunningFailed,
        Self::HpRunningFailure,
        Self::JobReady,
        Self::JobChecking,
        Self::JobConfirmed,
        Self::JobFailed,
        Self::JobFailure,
        Self::WaitResult,
        Self::Result,
        Self::HpFinishedReady,
        Self::HpFinishedChecking,
        Self::HpFinishedConfirmed,
        Self::HpFinishedFailed,
        Self::HpFinishedFailure,
        Self::HpExpireReady,
        Self::HpExpireChecking,
        Self::HpExpireConfirmed,
        Self::HpExpireFailed,
        Self::HpExpireFailure,
        Self::HpExpired,
        Self::Canceling,
        Self::KillReady,
        Self::KillChecking,
        Self::KillConfirmed,
        Self::KillFailed,
        Self::KillFailure,
        Self::HpCancelReady,
        Self::HpCancelChecking,
        Self::HpCancelConfirmed,
        Self::HpCancelFailed,
        Self::HpCancelFailure,
        Self::Canceled,
        Self::Success,
    ];

    /// Name persisted as the trial's `jobstate`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::RunnerReady => "RunnerReady",
            Self::RunnerChecking => "RunnerChecking",
            Self::RunnerConfirmed => "RunnerConfirmed",
            Self::RunnerFailed => "RunnerFailed",
            Self::RunnerFailure => "RunnerFailure",
            Self::Scheduling => "Scheduling",
            Self::HpRunningReady => "HpRunningReady",
            Self::HpRunningChecking => "HpRunningChecking",
            Self::HpRunningConfirmed => "HpRunningConfirmed",
            Self::HpRunningFailed => "HpRunningFailed",
            Self::HpRunningFailure => "HpRunningFailure",
            Self::JobReady => "JobReady",
            Self::JobChecking => "JobChecking",
            Self::JobConfirmed => "JobConfirmed",
            Self::JobFailed => "JobFailed",
            Self::JobFailure => "JobFailure",
            Self::WaitResult => "WaitResult",
            Self::Result => "Result",
            Self::HpFinishedReady => "HpFinishedReady",
            Self::HpFinishedChecking => "HpFinishedChecking",
            Self::HpFinishedConfirmed => "HpFinishedConfirmed",
            Self::HpFinishedFailed => "HpFinishedFailed",
            Self::HpFinishedFailure => "HpFinishedFailure",
            Self::HpExpireReady => "HpExpireReady",
            Self::HpExpireChecking => "HpExpireChecking",
            Self::HpExpireConfirmed => "HpExpireConfirmed",
            Self::HpExpireFailed => "HpExpireFailed",
            Self::HpExpireFailure => "HpExpireFailure",
            Self::HpExpired => "HpExpired",
            Self::Canceling => "Canceling",
            Self::KillReady => "KillReady",
            Self::KillChecking => "KillChecking",
            Self::KillConfirmed => "KillConfirmed",
            Self::KillFailed => "KillFailed",
            Self::KillFailure => "KillFailure",
            Self::HpCancelReady => "HpCancelReady",
            Self::HpCancelChecking => "HpCancelChecking",
            Self::HpCancelConfirmed => "HpCancelConfirmed",
            Self::HpCancelFailed => "HpCancelFailed",
            Self::HpCancelFailure => "HpCancelFailure",
            Self::Canceled => "Canceled",
            Self::Success => "Success",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::RunnerFailure
                | Self::HpRunningFailure
                | Self::JobFailure
                | Self::HpFinishedFailure
                | Self::HpExpireFailure
                | Self::KillFailure
                | Self::HpCancelFailure
        )
    }

    /// The job task exits once it reaches one of these.
    pub fn is_terminal(&self) -> bool {
        self.is_failure() || matches!(self, Self::Success | Self::Canceled | Self::HpExpired)
    }

    /// Retry states that loop back to their `*Ready` state.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::RunnerFailed
                | Self::HpRunningFailed
                | Self::JobFailed
                | Self::HpFinishedFailed
                | Self::HpExpireFailed
                | Self::KillFailed
                | Self::HpCancelFailed
        )
    }

    /// States whose deadline, once passed, fires `Expire`.
    ///
    /// `*Ready` states are included so a persistently failing action
    /// still leaves the phase.
    pub fn has_deadline(&self) -> bool {
        self.stamps_deadline()
            || matches!(
                self,
                Self::RunnerChecking
                    | Self::HpRunningChecking
                    | Self::JobChecking
                    | Self::WaitResult
                    | Self::HpFinishedChecking
                    | Self::HpExpireChecking
                    | Self::KillChecking
                    | Self::HpCancelChecking
            )
    }

    /// States that stamp a fresh deadline on entry.
    pub fn stamps_deadline(&self) -> bool {
        matches!(
            self,
            Self::RunnerReady
                | Self::HpRunningReady
                | Self::JobReady
                | Self::WaitResult
                | Self::HpFinishedReady
                | Self::HpExpireReady
                | Self::KillReady
                | Self::HpCancelReady
        )
    }

    pub fn phase(&self) -> Option<Phase> {
        use JobState::*;
        let phase = match self {
            RunnerReady | RunnerChecking | RunnerConfirmed | RunnerFailed | RunnerFailure => {
                Phase::Runner
            }
            HpRunningReady | HpRunningChecking | HpRunningConfirmed | HpRunningFailed
            | HpRunningFailure => Phase::Running,
            JobReady | JobChecking | JobConfirmed | JobFailed | JobFailure => Phase::Job,
            WaitResult | Result => Phase::Result,
            HpFinishedReady | HpFinishedChecking | HpFinishedConfirmed | HpFinishedFailed
            | HpFinishedFailure => Phase::Finished,
            HpExpireReady | HpExpireChecking | HpExpireConfirmed | HpExpireFailed
            | HpExpireFailure => Phase::Expire,
            KillReady | KillChecking | KillConfirmed | KillFailed | KillFailure => Phase::Kill,
            HpCancelReady | HpCancelChecking | HpCancelConfirmed | HpCancelFailed
            | HpCancelFailure => Phase::Cancel,
            Init | Scheduling | HpExpired | Canceling | Canceled | Success => return None,
        };
        Some(phase)
    }

    /// Whether a job in this state holds an execution slot.
    ///
    /// Runner preparation and `Scheduling` are ready-equivalent, and
    /// terminal states have released their slot.
    pub fn occupies_slot(&self) -> bool {
        !self.is_terminal()
            && !matches!(
                self,
                Self::Init
                    | Self::RunnerReady
                    | Self::RunnerChecking
                    | Self::RunnerConfirmed
                    | Self::RunnerFailed
                    | Self::Scheduling
            )
    }

    /// Whether a `Cancel` trigger routes this state into `Canceling`.
    pub fn accepts_cancel(&self) -> bool {
        !self.is_terminal()
            && !matches!(self.phase(), Some(Phase::Kill | Phase::Cancel))
            && *self != Self::Canceling
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for state in JobState::ALL {
            assert_eq!(JobState::from_name(state.name()), Some(state));
        }
        assert_eq!(JobState::from_name("Bogus"), None);
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = JobState::ALL
            .into_iter()
            .filter(JobState::is_terminal)
            .collect();
        assert_eq!(terminal.len(), 10);
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Canceled.is_terminal());
        assert!(JobState::HpExpired.is_terminal());
        assert!(!JobState::RunnerFailed.is_terminal());
    }

    #[test]
    fn every_deadline_state_is_stamped_by_its_phase() {
        for state in JobState::ALL.into_iter().filter(JobState::has_deadline) {
            let phase = state.phase().unwrap();
            assert!(
                JobState::ALL
                    .into_iter()
                    .any(|s| s.stamps_deadline() && s.phase() == Some(phase)),
                "{state} has no stamping state"
            );
        }
    }

    #[test]
    fn slot_occupancy() {
        assert!(!JobState::Scheduling.occupies_slot());
        assert!(!JobState::RunnerChecking.occupies_slot());
        assert!(JobState::HpRunningReady.occupies_slot());
        assert!(JobState::WaitResult.occupies_slot());
        assert!(JobState::KillChecking.occupies_slot());
        assert!(!JobState::JobFailure.occupies_slot());
        assert!(!JobState::Success.occupies_slot());
    }

    #[test]
    fn cancel_acceptance() {
        assert!(JobState::Scheduling.accepts_cancel());
        assert!(JobState::WaitResult.accepts_cancel());
        assert!(JobState::HpExpireChecking.accepts_cancel());
        assert!(!JobState::Canceling.accepts_cancel());
        assert!(!JobState::KillChecking.accepts_cancel());
        assert!(!JobState::HpCancelReady.accepts_cancel());
        assert!(!JobState::Success.accepts_cancel());
    }

    #[test]
    fn phase_budgets_come_from_config() {
        let config = JobConfig::default();
        assert_eq!(Phase::Job.budget(&config), config.job);
        assert_eq!(Phase::Kill.config_key(), "job.kill");
    }
}
