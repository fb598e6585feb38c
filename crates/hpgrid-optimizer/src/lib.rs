//! hpgrid-optimizer: the optimizer process.
//!
//! Samples parameter assignments from the configured search space and
//! stores them as ready trials, paced by the number of free execution
//! slots.

pub mod error;
pub mod optimizer;
pub mod sampler;

pub use error::{OptimizerError, OptimizerResult};
pub use optimizer::Optimizer;
pub use sampler::{GridSampler, RandomSampler, Sampler};
