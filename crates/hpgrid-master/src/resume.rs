//! Preparing a workspace to resume from a given trial.

use hpgrid_core::{TrialId, TrialState};
use hpgrid_job::JobState;
use hpgrid_state::TrialStore;
use tracing::info;

use crate::error::MasterResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeSummary {
    pub deleted: u32,
    pub rolled_back: u32,
}

/// Reset the store so a new run continues after trial `resume_from`.
///
/// - trials with an id above `resume_from` are deleted
/// - finished trials without an objective, and trials whose last job
///   failed terminally, go back to ready for another attempt
/// - every liveness flag is cleared
/// - verification records are dropped so conditions fire again against
///   the trimmed trial set
///
/// Trials left running keep their state; the scheduler re-attaches them.
pub fn prepare_resume(store: &TrialStore, resume_from: TrialId) -> MasterResult<ResumeSummary> {
    let deleted = store.delete_trials_after(resume_from)?;

    let mut rolled_back = 0;
    for trial in store.list_trials()? {
        let unfinished = trial.state == TrialState::Finished && trial.objective().is_none();
        let failed = trial
            .jobstate
            .as_deref()
            .and_then(JobState::from_name)
            .is_some_and(|s| s.is_failure());
        if unfinished || (failed && trial.state != TrialState::Finished) {
            store.rollback_to_ready(trial.trial_id)?;
            rolled_back += 1;
        }
    }

    store.clear_liveness()?;
    store.clear_verification()?;
    info!(resume_from, deleted, rolled_back, "workspace prepared for resume");
    Ok(ResumeSummary {
        deleted,
        rolled_back,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpgrid_core::Role;
    use hpgrid_state::{TrialResult, VerificationRecord};

    #[test]
    fn resume_trims_and_rolls_back() {
        let store = TrialStore::open_in_memory().unwrap();
        for id in 0..10 {
            store.create_trial(id, Vec::new()).unwrap();
        }
        // 0: finished with a result, 1: finished without one,
        // 2: failed runner, 3: still running.
        store
            .set_result(
                0,
                TrialResult {
                    objective: Some(vec![1.0]),
                    ..Default::default()
                },
            )
            .unwrap();
        store.set_state(0, TrialState::Finished).unwrap();
        store.set_state(1, TrialState::Finished).unwrap();
        store.set_jobstate(2, "RunnerFailure").unwrap();
        store.set_state(3, TrialState::Running).unwrap();
        store.set_jobstate(3, "JobChecking").unwrap();
        store.set_liveness(Role::Scheduler, true).unwrap();
        store
            .put_verification(&VerificationRecord {
                index: 0,
                trial_count: 8,
                best: Some(1.0),
                minimum: 0.0,
                maximum: 2.0,
                passed: true,
                evaluated_at: 0,
            })
            .unwrap();

        let summary = prepare_resume(&store, 5).unwrap();
        assert_eq!(
            summary,
            ResumeSummary {
                deleted: 4,
                rolled_back: 2
            }
        );

        assert_eq!(store.max_trial_id().unwrap(), Some(5));
        assert_eq!(store.get_state(0).unwrap(), TrialState::Finished);
        assert_eq!(store.get_state(1).unwrap(), TrialState::Ready);
        assert_eq!(store.get_jobstate(2).unwrap(), None);
        assert_eq!(store.get_state(3).unwrap(), TrialState::Running);
        assert!(!store.is_alive(Role::Scheduler).unwrap());
        assert!(store.list_verification().unwrap().is_empty());
    }
}
