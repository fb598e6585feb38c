//! hpgrid-scheduler: the scheduler process.
//!
//! Turns ready trials into running jobs without ever exceeding
//! `resource.num_node` concurrent executions.
//!
//! # Architecture
//!
//! ```text
//! Scheduler (Module, one control loop)
//!   ├── TrialStore (ready trials in, cancel requests in)
//!   ├── SchedulingAlgorithm (which waiting job gets a free slot)
//!   ├── Verification (best-objective checks as trials finish)
//!   └── JobHandle per in-flight trial
//!       └── Job task (hpgrid-job state machine) → JobBackend
//! ```

pub mod algorithm;
pub mod error;
pub mod scheduler;
pub mod verification;

pub use algorithm::{FifoScheduling, JobCandidate, RandomScheduling, SchedulingAlgorithm};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::Scheduler;
pub use verification::{Verification, best_objective};
