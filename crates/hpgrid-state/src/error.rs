//! Error types for the trial store.

use hpgrid_core::TrialId;
use thiserror::Error;

/// Result type alias for trial store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during trial store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("database still locked by another process after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("trial not found: {0}")]
    NotFound(TrialId),

    #[error("trial already exists: {0}")]
    AlreadyExists(TrialId),
}
