//! redb table definitions for the trial store.
//!
//! Values are JSON-serialized domain types.

use redb::TableDefinition;

/// Trial records keyed by trial id.
pub const TRIALS: TableDefinition<u64, &[u8]> = TableDefinition::new("trials");

/// Process liveness keyed by role name (`master`, `optimizer`, `scheduler`).
pub const LIVENESS: TableDefinition<&str, &[u8]> = TableDefinition::new("liveness");

/// Verification outcomes keyed by condition index.
pub const VERIFICATION: TableDefinition<u64, &[u8]> = TableDefinition::new("verification");
