//! hpgrid-core: shared building blocks for the hpgrid processes.
//!
//! - [`config`]: the `hpgrid.toml` configuration file
//! - [`types`]: trial, parameter, and role types shared by every crate
//! - [`workspace`]: the on-disk workspace directory layout
//! - [`module`]: the `pre_process → loop → post_process` lifecycle that
//!   Master, Optimizer and Scheduler all run under

pub mod config;
pub mod duration;
pub mod module;
pub mod types;
pub mod workspace;

pub use config::{ConfigError, HpgridConfig};
pub use module::{Module, run_module};
pub use types::*;
pub use workspace::Workspace;
