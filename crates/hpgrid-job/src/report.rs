//! Turning a finished trial command into a stored result, and counting run progress.

use std::path::Path;

use hpgrid_core::{TrialId, TrialState};
use hpgrid_state::{TrialResult, TrialStore};
use tracing::{debug, warn};

use crate::error::JobResult;
use crate::state::JobState;

const MAX_ERROR_LEN: usize = 4096;

/// Parse an objective line: one or more numbers separated by whitespace or commas.
pub fn parse_objective(line: &str) -> Option<Vec<f64>> {
    let values: Vec<f64> = line
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|tok| !tok.is_empty())
        .map(|tok| tok.parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    (!values.is_empty()).then_some(values)
}

/// The last non-empty line of a command's output.
pub fn last_non_empty_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).rfind(|l| !l.is_empty())
}

/// Read the error text a trial left behind, if any.
pub fn read_error_text(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let mut end = text.len().min(MAX_ERROR_LEN);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    Some(text[..end].to_string())
}

/// Store the result of a finished trial command.
///
/// A trial that has already been rolled back or deleted is skipped.
pub fn record_result(store: &TrialStore, trial_id: TrialId, result: TrialResult) -> JobResult<()> {
    if store.get_trial(trial_id)?.is_none() {
        warn!(trial_id, "result reported for unknown trial, dropping");
        return Ok(());
    }
    match &result.objective {
        Some(objective) => debug!(trial_id, ?objective, "objective recorded"),
        None => warn!(
            trial_id,
            exit_status = ?result.exit_status,
            "trial produced no objective"
        ),
    }
    store.set_result(trial_id, result)?;
    Ok(())
}

/// Trial counts of a run, with terminal job failures split out.
///
/// A trial whose job ended in a `*Failure` state keeps its `ready` or
/// `running` trial state; it is counted as `failed` instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub ready: u64,
    pub running: u64,
    pub finished: u64,
    pub failed: u64,
}

impl Progress {
    /// Trials that will not run again: finished plus failed.
    pub fn done(&self) -> u64 {
        self.finished + self.failed
    }

    pub fn total(&self) -> u64 {
        self.ready + self.running + self.finished + self.failed
    }
}

/// Count trials by stage. Master, Optimizer and Scheduler all measure the
/// trial budget with this.
pub fn progress(store: &TrialStore) -> JobResult<Progress> {
    let mut progress = Progress::default();
    for trial in store.list_trials()? {
        let failed = trial
            .jobstate
            .as_deref()
            .and_then(JobState::from_name)
            .is_some_and(|s| s.is_failure());
        match trial.state {
            TrialState::Finished => progress.finished += 1,
            _ if failed => progress.failed += 1,
            TrialState::Ready => progress.ready += 1,
            TrialState::Running => progress.running += 1,
            TrialState::Unknown => {}
        }
    }
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpgrid_core::{ParamValue, Parameter, ParameterKind};

    #[test]
    fn objective_parsing() {
        assert_eq!(parse_objective("1.5"), Some(vec![1.5]));
        assert_eq!(parse_objective("  -2 "), Some(vec![-2.0]));
        assert_eq!(parse_objective("0.1, 0.2"), Some(vec![0.1, 0.2]));
        assert_eq!(parse_objective("3 4\t5"), Some(vec![3.0, 4.0, 5.0]));
        assert_eq!(parse_objective("loss=0.3"), None);
        assert_eq!(parse_objective(""), None);
    }

    #[test]
    fn last_line_skips_blank_lines() {
        assert_eq!(last_non_empty_line("epoch 1\n0.25\n\n  \n"), Some("0.25"));
        assert_eq!(last_non_empty_line("\n\n"), None);
    }

    #[test]
    fn error_text_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("err.txt");
        assert_eq!(read_error_text(&path), None);

        std::fs::write(&path, "\n").unwrap();
        assert_eq!(read_error_text(&path), None);

        std::fs::write(&path, "Traceback\nValueError\n").unwrap();
        assert_eq!(read_error_text(&path).as_deref(), Some("Traceback\nValueError"));
    }

    #[test]
    fn record_result_skips_unknown_trial() {
        let store = TrialStore::open_in_memory().unwrap();
        record_result(&store, 9, TrialResult::default()).unwrap();
        assert!(store.get_trial(9).unwrap().is_none());

        store
            .create_trial(
                0,
                vec![Parameter::new("x", ParameterKind::UniformInt, ParamValue::Int(1))],
            )
            .unwrap();
        let result = TrialResult {
            objective: Some(vec![0.5]),
            ..Default::default()
        };
        record_result(&store, 0, result).unwrap();
        assert_eq!(store.get_objective(0).unwrap(), Some(vec![0.5]));
    }

    #[test]
    fn progress_splits_out_failed_trials() {
        let store = TrialStore::open_in_memory().unwrap();
        for id in 0..4 {
            store.create_trial(id, Vec::new()).unwrap();
        }
        store.set_state(0, TrialState::Finished).unwrap();
        store.set_jobstate(0, "Success").unwrap();
        store.set_jobstate(1, "RunnerFailure").unwrap();
        store.set_state(2, TrialState::Running).unwrap();
        store.set_jobstate(2, "JobChecking").unwrap();

        let p = progress(&store).unwrap();
        assert_eq!(
            p,
            Progress {
                ready: 1,
                running: 1,
                finished: 1,
                failed: 1
            }
        );
        assert_eq!(p.done(), 2);
        assert_eq!(p.total(), 4);
    }
}
