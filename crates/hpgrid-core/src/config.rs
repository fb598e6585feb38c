//! hpgrid.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::serde_duration;
use crate::types::Goal;

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid optimization goal: {0:?} (expected \"minimize\" or \"maximize\")")]
    InvalidGoal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpgridConfig {
    pub generic: GenericConfig,
    pub resource: ResourceConfig,
    pub abci: Option<AbciConfig>,
    pub optimize: OptimizeConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericConfig {
    /// Root of the run's workspace directory.
    pub workspace: PathBuf,
    /// User program invoked once per trial.
    pub job_command: String,
    /// Main-loop tick for Master, Optimizer and Scheduler.
    #[serde(default = "default_sleep_time", with = "serde_duration")]
    pub sleep_time: Duration,
    /// Zero-padding width of trial ids in file names.
    #[serde(default = "default_name_length")]
    pub name_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Local,
    Abci,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(rename = "type")]
    pub kind: ResourceType,
    /// Number of concurrent execution slots (`max_resource`).
    pub num_node: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbciConfig {
    pub group: String,
    /// File whose contents open every rendered batch script.
    pub job_script_preamble: PathBuf,
    /// Extra options placed before the script path on the submit line.
    #[serde(default)]
    pub job_execution_options: Vec<String>,
    #[serde(default = "default_submit_command")]
    pub submit_command: String,
    #[serde(default = "default_status_command")]
    pub status_command: String,
    #[serde(default = "default_delete_command")]
    pub delete_command: String,
    /// Attempts for one status query before the poll is given up.
    #[serde(default = "default_status_retry")]
    pub status_retry: u32,
    #[serde(default = "default_status_retry_delay", with = "serde_duration")]
    pub status_retry_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeConfig {
    /// Sampler name: "random" or "grid".
    #[serde(default = "default_search_algorithm")]
    pub search_algorithm: String,
    /// One goal per objective ("minimize" / "maximize").
    #[serde(default = "default_goal")]
    pub goal: Vec<String>,
    /// Total trial budget of the run.
    pub trial_number: u64,
    #[serde(default)]
    pub rand_seed: Option<u64>,
    pub parameters: Vec<ParameterSpec>,
}

/// One dimension of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterSpec {
    UniformFloat {
        name: String,
        lower: f64,
        upper: f64,
        #[serde(default)]
        log: bool,
        /// Grid resolution; only used by the grid sampler.
        #[serde(default)]
        num_numeric_choices: Option<usize>,
    },
    UniformInt {
        name: String,
        lower: i64,
        upper: i64,
        #[serde(default)]
        log: bool,
        #[serde(default)]
        num_numeric_choices: Option<usize>,
    },
    Categorical {
        name: String,
        choices: Vec<String>,
    },
    Ordinal {
        name: String,
        sequence: Vec<f64>,
    },
}

impl ParameterSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::UniformFloat { name, .. }
            | Self::UniformInt { name, .. }
            | Self::Categorical { name, .. }
            | Self::Ordinal { name, .. } => name,
        }
    }
}

/// Timeout and retry ceiling of one job phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseBudget {
    #[serde(with = "serde_duration")]
    pub timeout: Duration,
    pub retry: u32,
}

impl PhaseBudget {
    pub fn new(timeout: Duration, retry: u32) -> Self {
        Self { timeout, retry }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Poll interval of every Job task.
    #[serde(with = "serde_duration")]
    pub loop_duration: Duration,
    /// Scheduling policy: "random" or "fifo".
    pub scheduling: String,
    pub runner: PhaseBudget,
    pub running: PhaseBudget,
    pub job: PhaseBudget,
    pub result: PhaseBudget,
    pub finished: PhaseBudget,
    pub kill: PhaseBudget,
    pub cancel: PhaseBudget,
    pub expire: PhaseBudget,
}

impl Default for JobConfig {
    fn default() -> Self {
        let short = PhaseBudget::new(Duration::from_secs(60), 3);
        Self {
            loop_duration: Duration::from_millis(500),
            scheduling: "random".to_string(),
            runner: short,
            running: short,
            job: PhaseBudget::new(Duration::from_secs(3600), 3),
            result: short,
            finished: short,
            kill: short,
            cancel: short,
            expire: short,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Liveness polls allowed before a child counts as failed to start.
    pub startup_failure_limit: u32,
    /// How long post_process waits for children to exit on their own.
    #[serde(with = "serde_duration")]
    pub shutdown_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            startup_failure_limit: 30,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub enabled: bool,
    pub conditions: Vec<VerificationCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCondition {
    /// Finished-trial count at which the condition fires.
    #[serde(alias = "loop")]
    pub trial_count: u64,
    pub minimum: f64,
    pub maximum: f64,
}

impl HpgridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HpgridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Structural checks. Goal strings are deliberately not checked here:
    /// they are parsed where the evaluator is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generic.job_command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "generic.job_command cannot be empty".into(),
            ));
        }
        if self.resource.num_node == 0 {
            return Err(ConfigError::Invalid(
                "resource.num_node must be greater than 0".into(),
            ));
        }
        if self.resource.kind == ResourceType::Abci && self.abci.is_none() {
            return Err(ConfigError::Invalid(
                "resource.type = \"abci\" requires an [abci] section".into(),
            ));
        }
        if self.optimize.parameters.is_empty() {
            return Err(ConfigError::Invalid(
                "optimize.parameters must define at least one parameter".into(),
            ));
        }
        if self.optimize.goal.is_empty() {
            return Err(ConfigError::Invalid("optimize.goal cannot be empty".into()));
        }
        if self.job.loop_duration.is_zero() || self.generic.sleep_time.is_zero() {
            return Err(ConfigError::Invalid(
                "job.loop_duration and generic.sleep_time must be greater than 0".into(),
            ));
        }
        for spec in &self.optimize.parameters {
            match spec {
                ParameterSpec::UniformFloat {
                    name, lower, upper, log, ..
                } => {
                    if lower > upper {
                        return Err(ConfigError::Invalid(format!(
                            "parameter {name}: lower > upper"
                        )));
                    }
                    if *log && *lower <= 0.0 {
                        return Err(ConfigError::Invalid(format!(
                            "parameter {name}: log scale needs a positive lower bound"
                        )));
                    }
                }
                ParameterSpec::UniformInt {
                    name, lower, upper, log, ..
                } => {
                    if lower > upper {
                        return Err(ConfigError::Invalid(format!(
                            "parameter {name}: lower > upper"
                        )));
                    }
                    if *log && *lower <= 0 {
                        return Err(ConfigError::Invalid(format!(
                            "parameter {name}: log scale needs a positive lower bound"
                        )));
                    }
                }
                ParameterSpec::Categorical { name, choices } if choices.is_empty() => {
                    return Err(ConfigError::Invalid(format!(
                        "parameter {name}: choices cannot be empty"
                    )));
                }
                ParameterSpec::Ordinal { name, sequence } if sequence.is_empty() => {
                    return Err(ConfigError::Invalid(format!(
                        "parameter {name}: sequence cannot be empty"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Parsed goals, one per objective.
    pub fn goals(&self) -> Result<Vec<Goal>, ConfigError> {
        Goal::parse_all(&self.optimize.goal)
    }

    pub fn is_multi_objective(&self) -> bool {
        self.optimize.goal.len() > 1
    }

    pub fn max_resource(&self) -> usize {
        self.resource.num_node
    }
}

fn default_sleep_time() -> Duration {
    Duration::from_secs(1)
}

fn default_name_length() -> usize {
    6
}

fn default_submit_command() -> String {
    "qsub".to_string()
}

fn default_status_command() -> String {
    "qstat".to_string()
}

fn default_delete_command() -> String {
    "qdel".to_string()
}

fn default_status_retry() -> u32 {
    3
}

fn default_status_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_search_algorithm() -> String {
    "random".to_string()
}

fn default_goal() -> Vec<String> {
    vec!["minimize".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[generic]
workspace = "./work"
job_command = "python user.py"

[resource]
type = "local"
num_node = 4

[optimize]
trial_number = 30

[[optimize.parameters]]
type = "uniform_float"
name = "x1"
lower = -5.0
upper = 5.0
"#;

    #[test]
    fn parse_minimal_applies_defaults() {
        let config = HpgridConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.generic.name_length, 6);
        assert_eq!(config.generic.sleep_time, Duration::from_secs(1));
        assert_eq!(config.optimize.search_algorithm, "random");
        assert_eq!(config.optimize.goal, vec!["minimize"]);
        assert_eq!(config.job.loop_duration, Duration::from_millis(500));
        assert_eq!(config.job.job.timeout, Duration::from_secs(3600));
        assert_eq!(config.max_resource(), 4);
        assert!(!config.verification.enabled);
    }

    #[test]
    fn parse_phase_budgets_and_verification() {
        let toml_str = format!(
            "{MINIMAL}
[job]
loop_duration = \"100ms\"
scheduling = \"fifo\"

[job.runner]
timeout = \"2s\"
retry = 1

[verification]
enabled = true

[[verification.conditions]]
loop = 10
minimum = 0.0
maximum = 1.0
"
        );
        let config = HpgridConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(config.job.scheduling, "fifo");
        assert_eq!(
            config.job.runner,
            PhaseBudget::new(Duration::from_secs(2), 1)
        );
        // Untouched phases keep their defaults.
        assert_eq!(config.job.kill.retry, 3);
        assert_eq!(config.verification.conditions[0].trial_count, 10);
    }

    #[test]
    fn abci_requires_section() {
        let toml_str = MINIMAL.replace("type = \"local\"", "type = \"abci\"");
        let err = HpgridConfig::from_toml_str(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_resource_is_rejected() {
        let toml_str = MINIMAL.replace("num_node = 4", "num_node = 0");
        assert!(HpgridConfig::from_toml_str(&toml_str).is_err());
    }

    #[test]
    fn bad_goal_surfaces_at_use_not_at_load() {
        let toml_str = MINIMAL.replace("trial_number = 30", "trial_number = 30\ngoal = [\"lowest\"]");
        let config = HpgridConfig::from_toml_str(&toml_str).unwrap();
        assert!(matches!(config.goals(), Err(ConfigError::InvalidGoal(_))));
    }

    #[test]
    fn to_toml_round_trip() {
        let config = HpgridConfig::from_toml_str(MINIMAL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let back = HpgridConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(back.optimize.parameters, config.optimize.parameters);
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = HpgridConfig::from_file(Path::new("/nonexistent/hpgrid.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
