//! hpgrid-job: the per-trial job state machine.
//!
//! A [`JobHandle`] owns one tokio task that walks a trial from runner
//! creation through submission, result collection and finalization. Every
//! phase has its own timeout and retry budget; see [`transitions`] for the
//! shape of a phase.
//!
//! Execution is delegated to a [`JobBackend`]: [`LocalBackend`] spawns the
//! user command as a subprocess, [`AbciBackend`] renders a batch script
//! and drives `qsub`/`qstat`/`qdel`.

pub mod artifact;
pub mod backend;
pub mod error;
pub mod job;
pub mod report;
pub mod state;
pub mod transitions;

pub use backend::{AbciBackend, JobBackend, LocalBackend};
pub use error::{JobError, JobResult};
pub use job::{JobContext, JobHandle};
pub use report::{Progress, progress};
pub use state::{JobState, Phase, Trigger};
pub use transitions::TransitionTable;
