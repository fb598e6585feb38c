//! Final evaluation of a run.
//!
//! A single-objective run reports the best trial under its goal. A
//! multi-objective run reports the Pareto front: every finished trial no
//! other trial dominates.

use hpgrid_core::{Goal, Parameter, TrialId, TrialState, Workspace, epoch_secs};
use hpgrid_state::TrialRecord;
use serde::{Deserialize, Serialize};

use crate::error::{MasterError, MasterResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestTrial {
    pub trial_id: TrialId,
    pub parameters: Vec<Parameter>,
    pub objective: Vec<f64>,
}

/// Contents of `result/final_result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub goals: Vec<Goal>,
    pub finished: u64,
    pub best: Vec<BestTrial>,
    pub evaluated_at: u64,
}

pub struct Evaluator {
    goals: Vec<Goal>,
}

impl Evaluator {
    /// Fails on an unknown goal string.
    pub fn new(goals: &[String]) -> MasterResult<Self> {
        Ok(Self {
            goals: Goal::parse_all(goals)?,
        })
    }

    pub fn goals(&self) -> &[Goal] {
        &self.goals
    }

    pub fn evaluate(&self, trials: &[TrialRecord]) -> FinalResult {
        let scored: Vec<BestTrial> = trials
            .iter()
            .filter(|t| t.state == TrialState::Finished)
            .filter_map(|t| {
                let objective = t.objective()?;
                (objective.len() == self.goals.len() && !objective.iter().any(|v| v.is_nan()))
                    .then(|| BestTrial {
                        trial_id: t.trial_id,
                        parameters: t.parameters.clone(),
                        objective: objective.to_vec(),
                    })
            })
            .collect();

        let best = if self.goals.len() == 1 {
            self.best_single(&scored)
        } else {
            self.pareto_front(&scored)
        };

        FinalResult {
            goals: self.goals.clone(),
            finished: trials
                .iter()
                .filter(|t| t.state == TrialState::Finished)
                .count() as u64,
            best,
            evaluated_at: epoch_secs(),
        }
    }

    /// The first trial (by id) holding the best value.
    fn best_single(&self, scored: &[BestTrial]) -> Vec<BestTrial> {
        let goal = self.goals[0];
        scored
            .iter()
            .reduce(|best, t| {
                if goal.is_better(t.objective[0], best.objective[0]) {
                    t
                } else {
                    best
                }
            })
            .cloned()
            .into_iter()
            .collect()
    }

    fn pareto_front(&self, scored: &[BestTrial]) -> Vec<BestTrial> {
        scored
            .iter()
            .filter(|candidate| {
                !scored
                    .iter()
                    .any(|other| dominates(&other.objective, &candidate.objective, &self.goals))
            })
            .cloned()
            .collect()
    }

    /// Write the evaluation to `result/final_result.json`.
    pub fn write(&self, workspace: &Workspace, result: &FinalResult) -> MasterResult<()> {
        let path = workspace.final_result_file();
        let io_err = |source| MasterError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&path, serde_json::to_vec_pretty(result)?).map_err(io_err)?;
        Ok(())
    }
}

/// `a` is at least as good as `b` everywhere and strictly better somewhere.
fn dominates(a: &[f64], b: &[f64], goals: &[Goal]) -> bool {
    let mut strictly_better = false;
    for ((x, y), goal) in a.iter().zip(b).zip(goals) {
        if goal.is_better(*y, *x) {
            return false;
        }
        if goal.is_better(*x, *y) {
            strictly_better = true;
        }
    }
    strictly_better
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpgrid_state::TrialResult;

    fn trial(id: TrialId, state: TrialState, objective: Option<Vec<f64>>) -> TrialRecord {
        TrialRecord {
            trial_id: id,
            state,
            jobstate: None,
            parameters: Vec::new(),
            result: Some(TrialResult {
                objective,
                ..Default::default()
            }),
            cancel_requested: false,
            expire_count: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn invalid_goal_is_an_error() {
        assert!(matches!(
            Evaluator::new(&["minimise".to_string()]),
            Err(MasterError::Config(_))
        ));
    }

    #[test]
    fn single_objective_best_by_goal() {
        let trials = vec![
            trial(0, TrialState::Finished, Some(vec![3.0])),
            trial(1, TrialState::Finished, Some(vec![1.0])),
            trial(2, TrialState::Running, Some(vec![0.1])),
            trial(3, TrialState::Finished, None),
            trial(4, TrialState::Finished, Some(vec![1.0])),
        ];

        let min = Evaluator::new(&["minimize".into()]).unwrap().evaluate(&trials);
        assert_eq!(min.finished, 4);
        assert_eq!(min.best.len(), 1);
        assert_eq!(min.best[0].trial_id, 1);

        let max = Evaluator::new(&["maximize".into()]).unwrap().evaluate(&trials);
        assert_eq!(max.best[0].trial_id, 0);
    }

    #[test]
    fn no_finished_trials_has_no_best() {
        let result = Evaluator::new(&["minimize".into()]).unwrap().evaluate(&[]);
        assert!(result.best.is_empty());
    }

    #[test]
    fn multi_objective_reports_pareto_front() {
        let trials = vec![
            trial(0, TrialState::Finished, Some(vec![1.0, 5.0])),
            trial(1, TrialState::Finished, Some(vec![5.0, 1.0])),
            trial(2, TrialState::Finished, Some(vec![3.0, 3.0])),
            trial(3, TrialState::Finished, Some(vec![4.0, 4.0])),
            trial(4, TrialState::Finished, Some(vec![2.0])),
        ];
        let evaluator = Evaluator::new(&["minimize".into(), "minimize".into()]).unwrap();
        let ids: Vec<TrialId> = evaluator.evaluate(&trials).best.iter().map(|b| b.trial_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn mixed_directions_dominance() {
        let goals = [Goal::Minimize, Goal::Maximize];
        assert!(dominates(&[1.0, 5.0], &[2.0, 4.0], &goals));
        assert!(!dominates(&[1.0, 3.0], &[2.0, 4.0], &goals));
        assert!(!dominates(&[1.0, 5.0], &[1.0, 5.0], &goals));
    }

    #[test]
    fn writes_final_result_file() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path(), 6);
        let evaluator = Evaluator::new(&["minimize".into()]).unwrap();
        let result = evaluator.evaluate(&[trial(0, TrialState::Finished, Some(vec![0.5]))]);
        evaluator.write(&ws, &result).unwrap();

        let back: FinalResult =
            serde_json::from_slice(&std::fs::read(ws.final_result_file()).unwrap()).unwrap();
        assert_eq!(back, result);
    }
}
