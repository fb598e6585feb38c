//! Domain types shared by every hpgrid process.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Unique, monotonically assigned trial identifier.
pub type TrialId = u64;

// ── Trial lifecycle ───────────────────────────────────────────────

/// Coarse lifecycle stage of a trial, visible to all three processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Ready,
    Running,
    Finished,
    Unknown,
}

impl TrialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown trial state: {other}")),
        }
    }
}

// ── Process roles ─────────────────────────────────────────────────

/// The three cooperating processes of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Optimizer,
    Scheduler,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Master, Role::Optimizer, Role::Scheduler];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Optimizer => "optimizer",
            Self::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Parameters ────────────────────────────────────────────────────

/// Kind of a hyperparameter, mirrored from the search space definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    UniformFloat,
    UniformInt,
    Categorical,
    Ordinal,
}

/// A sampled hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Str(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// One `{name, kind, value}` entry of a trial's parameter assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
    pub value: ParamValue,
}

impl Parameter {
    pub fn new(name: impl Into<String>, kind: ParameterKind, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
        }
    }

    /// Render as a `--name=value` command-line argument.
    pub fn to_arg(&self) -> String {
        format!("--{}={}", self.name, self.value)
    }
}

// ── Optimization goal ─────────────────────────────────────────────

/// Direction of optimization for one objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    Minimize,
    Maximize,
}

impl Goal {
    /// Whether `candidate` improves on `incumbent` under this goal.
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Minimize => candidate < incumbent,
            Self::Maximize => candidate > incumbent,
        }
    }

    /// Parse every configured goal string; the first bad one is an error.
    pub fn parse_all(goals: &[String]) -> Result<Vec<Goal>, ConfigError> {
        goals.iter().map(|g| g.parse()).collect()
    }
}

impl FromStr for Goal {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimize" => Ok(Self::Minimize),
            "maximize" => Ok(Self::Maximize),
            _ => Err(ConfigError::InvalidGoal(s.to_string())),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────

/// Zero-pad a trial id to the configured width for file naming.
pub fn format_trial_id(id: TrialId, width: usize) -> String {
    format!("{id:0width$}")
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trial_state_round_trips_through_str() {
        for state in [
            TrialState::Ready,
            TrialState::Running,
            TrialState::Finished,
            TrialState::Unknown,
        ] {
            assert_eq!(state.as_str().parse::<TrialState>().unwrap(), state);
        }
        assert!("done".parse::<TrialState>().is_err());
    }

    #[test]
    fn goal_parsing_is_case_insensitive() {
        assert_eq!("Minimize".parse::<Goal>().unwrap(), Goal::Minimize);
        assert_eq!("MAXIMIZE".parse::<Goal>().unwrap(), Goal::Maximize);
        assert!(matches!(
            "smallest".parse::<Goal>(),
            Err(ConfigError::InvalidGoal(_))
        ));
    }

    #[test]
    fn goal_comparison() {
        assert!(Goal::Minimize.is_better(1.0, 2.0));
        assert!(!Goal::Minimize.is_better(2.0, 1.0));
        assert!(Goal::Maximize.is_better(2.0, 1.0));
    }

    #[test]
    fn trial_id_padding() {
        assert_eq!(format_trial_id(7, 6), "000007");
        assert_eq!(format_trial_id(1234567, 6), "1234567");
    }

    #[test]
    fn parameter_renders_as_cli_arg() {
        let p = Parameter::new("lr", ParameterKind::UniformFloat, ParamValue::Float(0.5));
        assert_eq!(p.to_arg(), "--lr=0.5");
        let p = Parameter::new("opt", ParameterKind::Categorical, ParamValue::Str("adam".into()));
        assert_eq!(p.to_arg(), "--opt=adam");
    }

    #[test]
    fn param_value_serializes_untagged() {
        let json = serde_json::to_string(&ParamValue::Int(3)).unwrap();
        assert_eq!(json, "3");
        let back: ParamValue = serde_json::from_str("2.5").unwrap();
        assert_eq!(back, ParamValue::Float(2.5));
    }
}
