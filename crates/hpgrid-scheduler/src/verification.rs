//! Verification: sanity checks on the best objective during a run.
//!
//! Each configured condition fires once, the first time the number of
//! finished trials reaches its `trial_count`. It passes when the best
//! objective among the first `trial_count` finished trials (by trial id)
//! lies within `[minimum, maximum]`. Outcomes are stored in the trial
//! store, so a condition never fires twice even across processes.

use std::collections::HashSet;

use hpgrid_core::config::VerificationCondition;
use hpgrid_core::{Goal, HpgridConfig, TrialState, Workspace, epoch_secs};
use hpgrid_state::{TrialRecord, TrialStore, VerificationRecord};
use tracing::{info, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// Best single objective among `trials` under `goal`.
pub fn best_objective<'a>(trials: impl IntoIterator<Item = &'a TrialRecord>, goal: Goal) -> Option<f64> {
    trials
        .into_iter()
        .filter_map(|t| t.objective()?.first().copied())
        .filter(|v| !v.is_nan())
        .reduce(|best, v| if goal.is_better(v, best) { v } else { best })
}

pub struct Verification {
    conditions: Vec<VerificationCondition>,
    goal: Goal,
    workspace: Workspace,
}

impl Verification {
    /// `None` when verification is disabled or the run is multi-objective.
    pub fn from_config(config: &HpgridConfig, workspace: Workspace) -> SchedulerResult<Option<Self>> {
        if !config.verification.enabled || config.verification.conditions.is_empty() {
            return Ok(None);
        }
        if config.is_multi_objective() {
            info!("verification skipped for multi-objective run");
            return Ok(None);
        }
        let goal = config.goals()?[0];
        Ok(Some(Self {
            conditions: config.verification.conditions.clone(),
            goal,
            workspace,
        }))
    }

    /// Evaluate every condition that is due and has not fired yet.
    ///
    /// Returns the newly fired records.
    pub fn run(&self, store: &TrialStore) -> SchedulerResult<Vec<VerificationRecord>> {
        let fired: HashSet<u64> = store.list_verification()?.iter().map(|r| r.index).collect();
        let finished = store.list_by_state(TrialState::Finished)?;
        let mut new_records = Vec::new();

        for (index, condition) in self.conditions.iter().enumerate() {
            let index = index as u64;
            if fired.contains(&index) || (finished.len() as u64) < condition.trial_count {
                continue;
            }
            let window = &finished[..condition.trial_count as usize];
            let best = best_objective(window, self.goal);
            let passed = best.is_some_and(|b| b >= condition.minimum && b <= condition.maximum);
            let record = VerificationRecord {
                index,
                trial_count: condition.trial_count,
                best,
                minimum: condition.minimum,
                maximum: condition.maximum,
                passed,
                evaluated_at: epoch_secs(),
            };
            if !store.put_verification_if_absent(&record)? {
                continue;
            }
            if passed {
                info!(index, trial_count = condition.trial_count, ?best, "verification passed");
            } else {
                warn!(
                    index,
                    trial_count = condition.trial_count,
                    ?best,
                    minimum = condition.minimum,
                    maximum = condition.maximum,
                    "verification failed"
                );
            }
            new_records.push(record);
        }

        if !new_records.is_empty() {
            self.write_report(store)?;
        }
        Ok(new_records)
    }

    /// Write every stored outcome to `verification/verification.json`.
    pub fn write_report(&self, store: &TrialStore) -> SchedulerResult<()> {
        let records = store.list_verification()?;
        let path = self.workspace.verification_file();
        let io_err = |source| SchedulerError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&path, serde_json::to_vec_pretty(&records)?).map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpgrid_state::TrialResult;

    const CONFIG: &str = r#"
[generic]
workspace = "./work"
job_command = "python user.py"

[resource]
type = "local"
num_node = 1

[optimize]
trial_number = 10

[[optimize.parameters]]
type = "uniform_float"
name = "x1"
lower = 0.0
upper = 1.0

[verification]
enabled = true

[[verification.conditions]]
loop = 2
minimum = 0.0
maximum = 0.5

[[verification.conditions]]
loop = 4
minimum = 0.0
maximum = 0.1
"#;

    fn finish(store: &TrialStore, id: u64, objective: f64) {
        store.create_trial(id, Vec::new()).unwrap();
        store
            .set_result(
                id,
                TrialResult {
                    objective: Some(vec![objective]),
                    ..Default::default()
                },
            )
            .unwrap();
        store.set_state(id, TrialState::Finished).unwrap();
    }

    #[test]
    fn best_objective_respects_goal() {
        let store = TrialStore::open_in_memory().unwrap();
        finish(&store, 0, 3.0);
        finish(&store, 1, 1.0);
        finish(&store, 2, 2.0);
        let trials = store.list_trials().unwrap();
        assert_eq!(best_objective(&trials, Goal::Minimize), Some(1.0));
        assert_eq!(best_objective(&trials, Goal::Maximize), Some(3.0));
        assert_eq!(best_objective(&Vec::<TrialRecord>::new(), Goal::Minimize), None);
    }

    #[test]
    fn conditions_fire_once_when_due() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path(), 6);
        let config = HpgridConfig::from_toml_str(CONFIG).unwrap();
        let verification = Verification::from_config(&config, ws.clone()).unwrap().unwrap();
        let store = TrialStore::open_in_memory().unwrap();

        finish(&store, 0, 0.9);
        assert!(verification.run(&store).unwrap().is_empty());

        finish(&store, 1, 0.3);
        let fired = verification.run(&store).unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].best, Some(0.3));
        assert!(fired[0].passed);
        assert!(verification.run(&store).unwrap().is_empty());

        finish(&store, 2, 0.2);
        finish(&store, 3, 0.15);
        let fired = verification.run(&store).unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].index, 1);
        assert!(!fired[0].passed);

        let report: Vec<VerificationRecord> =
            serde_json::from_slice(&std::fs::read(ws.verification_file()).unwrap()).unwrap();
        assert_eq!(report.len(), 2);
    }

    #[test]
    fn concurrent_runs_fire_each_condition_once() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path(), 6);
        let config = HpgridConfig::from_toml_str(CONFIG).unwrap();
        let store = TrialStore::open(&dir.path().join("trials.redb")).unwrap();
        finish(&store, 0, 0.9);
        finish(&store, 1, 0.3);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let verification = Verification::from_config(&config, ws.clone()).unwrap().unwrap();
                std::thread::spawn(move || verification.run(&store).unwrap().len())
            })
            .collect();
        let fired: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(fired, 1);
        assert_eq!(store.list_verification().unwrap().len(), 1);
    }

    #[test]
    fn disabled_or_multi_objective_skips() {
        let mut config = HpgridConfig::from_toml_str(CONFIG).unwrap();
        let ws = Workspace::new("/tmp/unused", 6);
        config.optimize.goal = vec!["minimize".into(), "maximize".into()];
        assert!(Verification::from_config(&config, ws.clone()).unwrap().is_none());

        config.optimize.goal = vec!["minimize".into()];
        config.verification.enabled = false;
        assert!(Verification::from_config(&config, ws).unwrap().is_none());
    }
}
