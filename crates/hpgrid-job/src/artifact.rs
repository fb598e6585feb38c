//! Per-trial result artifact written to `result/<id>.json`.

use hpgrid_core::{Parameter, TrialId, Workspace};
use hpgrid_state::TrialRecord;
use serde::{Deserialize, Serialize};

use crate::error::{JobError, JobResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultArtifact {
    pub trial_id: TrialId,
    pub parameters: Vec<Parameter>,
    pub objective: Option<Vec<f64>>,
    pub error: Option<String>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub exit_status: Option<i32>,
}

impl From<&TrialRecord> for ResultArtifact {
    fn from(trial: &TrialRecord) -> Self {
        let result = trial.result.clone().unwrap_or_default();
        Self {
            trial_id: trial.trial_id,
            parameters: trial.parameters.clone(),
            objective: result.objective,
            error: result.error,
            start_time: result.start_time,
            end_time: result.end_time,
            exit_status: result.exit_status,
        }
    }
}

pub fn write_artifact(workspace: &Workspace, trial: &TrialRecord) -> JobResult<()> {
    let path = workspace.result_file(trial.trial_id);
    let body = serde_json::to_vec_pretty(&ResultArtifact::from(trial))?;
    std::fs::write(&path, body).map_err(|e| JobError::io("write", path, e))
}

pub fn read_artifact(workspace: &Workspace, trial_id: TrialId) -> JobResult<ResultArtifact> {
    let path = workspace.result_file(trial_id);
    let body = std::fs::read(&path).map_err(|e| JobError::io("read", path, e))?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpgrid_core::{ParamValue, ParameterKind, TrialState};
    use hpgrid_state::TrialResult;

    #[test]
    fn artifact_carries_parameters_and_result() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path(), 6);
        ws.create().unwrap();

        let trial = TrialRecord {
            trial_id: 4,
            state: TrialState::Running,
            jobstate: Some("HpFinishedReady".into()),
            parameters: vec![Parameter::new(
                "x1",
                ParameterKind::UniformFloat,
                ParamValue::Float(0.75),
            )],
            result: Some(TrialResult {
                objective: Some(vec![0.75]),
                exit_status: Some(0),
                ..Default::default()
            }),
            cancel_requested: false,
            expire_count: 0,
            created_at: 1,
            updated_at: 2,
        };
        write_artifact(&ws, &trial).unwrap();

        assert!(ws.result_file(4).ends_with("result/000004.json"));
        let artifact = read_artifact(&ws, 4).unwrap();
        assert_eq!(artifact.objective, Some(vec![0.75]));
        assert_eq!(artifact.parameters, trial.parameters);
        assert_eq!(artifact.exit_status, Some(0));
    }
}
