//! Optimizer: keeps the ready queue topped up with new trials.
//!
//! Each tick it creates just enough trials to fill the free execution
//! slots (`max_resource − (ready + running)`) without exceeding the trial
//! budget. Once the whole budget is allocated it idles until the run is
//! done, then exits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hpgrid_core::{HpgridConfig, Module, Role};
use hpgrid_job::progress;
use hpgrid_state::TrialStore;
use tracing::{debug, info, warn};

use crate::error::{OptimizerError, OptimizerResult};
use crate::sampler::{self, Sampler};

pub struct Optimizer {
    config: Arc<HpgridConfig>,
    store: TrialStore,
    sampler: Box<dyn Sampler>,
    exhausted: bool,
}

impl Optimizer {
    pub fn new(config: HpgridConfig, store: TrialStore) -> OptimizerResult<Self> {
        let sampler = sampler::from_name(
            &config.optimize.search_algorithm,
            &config.optimize.parameters,
            config.optimize.rand_seed,
        )?;
        Self::with_sampler(config, store, sampler)
    }

    pub fn with_sampler(
        config: HpgridConfig,
        store: TrialStore,
        sampler: Box<dyn Sampler>,
    ) -> OptimizerResult<Self> {
        let trial_number = config.optimize.trial_number;
        if let Some(points) = sampler.size() {
            if points < trial_number {
                return Err(OptimizerError::SearchSpaceTooSmall {
                    points,
                    trial_number,
                });
            }
        }
        Ok(Self {
            config: Arc::new(config),
            store,
            sampler,
            exhausted: false,
        })
    }

    fn allocated(&self) -> OptimizerResult<u64> {
        Ok(self.store.max_trial_id()?.map_or(0, |id| id + 1))
    }

    /// Create up to `min(free slots, remaining budget)` trials.
    fn generate_trials(&mut self) -> OptimizerResult<u64> {
        let progress = progress(&self.store)?;
        let remaining = self
            .config
            .optimize
            .trial_number
            .saturating_sub(self.allocated()?);
        let pool = (self.config.max_resource() as u64)
            .saturating_sub(progress.ready + progress.running);
        let count = pool.min(remaining);

        let mut created = 0;
        for _ in 0..count {
            let Some(parameters) = self.sampler.generate() else {
                if !self.exhausted {
                    warn!(sampler = self.sampler.name(), "search space exhausted");
                    self.exhausted = true;
                }
                break;
            };
            let trial_id = self.store.allocate_trial(parameters)?;
            debug!(trial_id, "trial created");
            created += 1;
        }
        if created > 0 {
            info!(created, remaining = remaining - created, "trials generated");
        }
        Ok(created)
    }
}

#[async_trait]
impl Module for Optimizer {
    type Error = OptimizerError;

    fn role(&self) -> Role {
        Role::Optimizer
    }

    fn loop_interval(&self) -> Duration {
        self.config.generic.sleep_time
    }

    async fn pre_process(&mut self) -> OptimizerResult<()> {
        self.store.set_liveness(Role::Optimizer, true)?;
        let existing = self.allocated()?;
        if existing > 0 {
            self.sampler.fast_forward(existing);
            info!(existing, "sampler fast-forwarded past existing trials");
        }
        info!(
            sampler = self.sampler.name(),
            trial_number = self.config.optimize.trial_number,
            "optimizer ready"
        );
        Ok(())
    }

    async fn inner_loop_main_process(&mut self) -> OptimizerResult<bool> {
        let progress = progress(&self.store)?;
        if progress.done() >= self.config.optimize.trial_number {
            info!(
                finished = progress.finished,
                failed = progress.failed,
                "trial budget reached"
            );
            return Ok(false);
        }
        self.generate_trials()?;
        Ok(true)
    }

    async fn post_process(&mut self) -> OptimizerResult<()> {
        self.store.set_liveness(Role::Optimizer, false)?;
        Ok(())
    }

    async fn on_abort(&mut self) {
        if let Err(e) = self.store.set_liveness(Role::Optimizer, false) {
            warn!(error = %e, "failed to clear optimizer liveness");
        }
    }
}
