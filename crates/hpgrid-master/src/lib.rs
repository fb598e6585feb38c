//! hpgrid-master: the master process.
//!
//! - [`launcher`]: starting the optimizer and scheduler (OS processes or tasks)
//! - [`master`]: the supervising [`Master`] module
//! - [`evaluator`]: best trial / Pareto front and `final_result.json`
//! - [`resume`]: trimming and rolling back a store before a resumed run

pub mod error;
pub mod evaluator;
pub mod launcher;
pub mod master;
pub mod resume;

pub use error::{MasterError, MasterResult};
pub use evaluator::{BestTrial, Evaluator, FinalResult};
pub use launcher::{ChildExit, ModuleChild, ModuleLauncher, ProcessLauncher, TaskLauncher};
pub use master::Master;
pub use resume::{ResumeSummary, prepare_resume};
