//! Scheduling policies.
//!
//! A policy picks which waiting jobs start this tick. It never returns
//! more trials than there are free slots.

use hpgrid_core::TrialId;

use crate::error::{SchedulerError, SchedulerResult};

/// A job waiting in `Scheduling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobCandidate {
    pub trial_id: TrialId,
}

pub trait SchedulingAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    /// Choose at most `available` candidates to start.
    fn select(&mut self, candidates: &[JobCandidate], available: usize) -> Vec<TrialId>;
}

/// Uniformly random choice among the waiting jobs.
pub struct RandomScheduling {
    rng: fastrand::Rng,
}

impl RandomScheduling {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }
}

impl Default for RandomScheduling {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulingAlgorithm for RandomScheduling {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&mut self, candidates: &[JobCandidate], available: usize) -> Vec<TrialId> {
        let mut ids: Vec<TrialId> = candidates.iter().map(|c| c.trial_id).collect();
        self.rng.shuffle(&mut ids);
        ids.truncate(available);
        ids
    }
}

/// Lowest trial id first.
#[derive(Debug, Default)]
pub struct FifoScheduling;

impl SchedulingAlgorithm for FifoScheduling {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn select(&mut self, candidates: &[JobCandidate], available: usize) -> Vec<TrialId> {
        let mut ids: Vec<TrialId> = candidates.iter().map(|c| c.trial_id).collect();
        ids.sort_unstable();
        ids.truncate(available);
        ids
    }
}

/// Build the policy named by `job.scheduling`.
pub fn from_name(name: &str, seed: Option<u64>) -> SchedulerResult<Box<dyn SchedulingAlgorithm>> {
    match name.to_ascii_lowercase().as_str() {
        "random" => Ok(Box::new(match seed {
            Some(seed) => RandomScheduling::with_seed(seed),
            None => RandomScheduling::new(),
        })),
        "fifo" => Ok(Box::new(FifoScheduling)),
        _ => Err(SchedulerError::UnknownAlgorithm(name.to_string())),
    }
}
