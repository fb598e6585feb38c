//! hpgrid-state: the durable trial store.
//!
//! Backed by [redb](https://docs.rs/redb). Every trial, liveness flag and
//! verification outcome of a run lives here, and it is the only channel
//! through which the master, optimizer and scheduler processes talk to
//! each other.
//!
//! # Architecture
//!
//! Domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Trials are keyed by their numeric id so iteration is in id order.
//!
//! Two backends exist. The in-memory backend shares one `Arc<Database>`
//! (tests, single-process use). The file backend opens the database for
//! each operation, because redb holds an exclusive file lock while a
//! `Database` is alive; another process holding the lock surfaces as
//! contention and is retried with bounded backoff.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{RetryPolicy, TrialStore};
pub use types::*;
