//! Persisted record types of the trial store.

use hpgrid_core::{Parameter, Role, TrialId, TrialState};
use serde::{Deserialize, Serialize};

// ── Trial ─────────────────────────────────────────────────────────

/// Durable record of one trial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialRecord {
    pub trial_id: TrialId,
    pub state: TrialState,
    /// Name of the owning job's state machine state, if any job ran.
    pub jobstate: Option<String>,
    /// Sampled assignment; written once at creation.
    pub parameters: Vec<Parameter>,
    pub result: Option<TrialResult>,
    /// Set by `hpgrid cancel`, consumed by the scheduler.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Times a job expired the trial back to ready without a result.
    #[serde(default)]
    pub expire_count: u32,
    /// Unix timestamp when the trial was created.
    pub created_at: u64,
    /// Unix timestamp of the last change.
    pub updated_at: u64,
}

impl TrialRecord {
    pub fn objective(&self) -> Option<&[f64]> {
        self.result.as_ref()?.objective.as_deref()
    }
}

/// Outcome reported by a trial's command.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrialResult {
    /// One value per objective; `None` when the command produced none.
    pub objective: Option<Vec<f64>>,
    pub error: Option<String>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub exit_status: Option<i32>,
}

/// Trial counts per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrialCounts {
    pub ready: u64,
    pub running: u64,
    pub finished: u64,
}

impl TrialCounts {
    pub fn total(&self) -> u64 {
        self.ready + self.running + self.finished
    }
}

// ── Liveness ──────────────────────────────────────────────────────

/// Liveness flag of one process role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LivenessRecord {
    pub role: Role,
    pub alive: bool,
    pub pid: u32,
    pub updated_at: u64,
}

// ── Verification ──────────────────────────────────────────────────

/// Outcome of one verification condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationRecord {
    pub index: u64,
    pub trial_count: u64,
    /// Best objective among the first `trial_count` finished trials.
    pub best: Option<f64>,
    pub minimum: f64,
    pub maximum: f64,
    pub passed: bool,
    pub evaluated_at: u64,
}
