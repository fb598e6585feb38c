//! TrialStore: redb-backed trial persistence for hpgrid.
//!
//! Provides typed operations over trials, process liveness and
//! verification outcomes. Every read-modify-write runs inside a single
//! redb write transaction, so concurrent writers never interleave.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hpgrid_core::{Parameter, Role, TrialId, TrialState, epoch_secs};
use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Backoff applied while another process holds the database file lock.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 200,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(200),
        }
    }
}

struct FileBackend {
    path: PathBuf,
    // Serializes opens from the same process; redb rejects a second handle.
    open_lock: Mutex<()>,
    retry: RetryPolicy,
}

#[derive(Clone)]
enum Backend {
    Shared(Arc<Database>),
    File(Arc<FileBackend>),
}

/// Thread-safe, multi-process trial store.
#[derive(Clone)]
pub struct TrialStore {
    backend: Backend,
}

fn encode<T: serde::Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

impl TrialStore {
    /// Open (or create) the store file at `path`.
    pub fn open(path: &Path) -> StateResult<Self> {
        Self::open_with_retry(path, RetryPolicy::default())
    }

    pub fn open_with_retry(path: &Path, retry: RetryPolicy) -> StateResult<Self> {
        let store = Self {
            backend: Backend::File(Arc::new(FileBackend {
                path: path.to_path_buf(),
                open_lock: Mutex::new(()),
                retry,
            })),
        };
        store.with_db(ensure_tables)?;
        debug!(?path, "trial store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        ensure_tables(&db)?;
        debug!("in-memory trial store opened");
        Ok(Self {
            backend: Backend::Shared(Arc::new(db)),
        })
    }

    /// Run `f` against an open database handle.
    fn with_db<T>(&self, f: impl FnOnce(&Database) -> StateResult<T>) -> StateResult<T> {
        let file = match &self.backend {
            Backend::Shared(db) => return f(db),
            Backend::File(file) => file,
        };

        let _guard = file.open_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delay = file.retry.initial_delay;
        for attempt in 1..=file.retry.attempts {
            match Database::create(&file.path) {
                Ok(db) => return f(&db),
                Err(DatabaseError::DatabaseAlreadyOpen) => {
                    if attempt % 50 == 0 {
                        warn!(path = ?file.path, attempt, "trial store still locked");
                    }
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(file.retry.max_delay);
                }
                Err(e) => return Err(StateError::Open(e.to_string())),
            }
        }
        Err(StateError::Contention {
            attempts: file.retry.attempts,
        })
    }

    /// Apply `mutate` to one trial inside a single write transaction.
    fn update_trial<T>(
        &self,
        trial_id: TrialId,
        mutate: impl FnOnce(&mut TrialRecord) -> T,
    ) -> StateResult<T> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            let out;
            {
                let mut table = txn.open_table(TRIALS).map_err(map_err!(Table))?;
                let current: Option<TrialRecord> = match table.get(trial_id).map_err(map_err!(Read))? {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                };
                let Some(mut record) = current else {
                    return Err(StateError::NotFound(trial_id));
                };
                out = mutate(&mut record);
                record.updated_at = epoch_secs();
                let value = encode(&record)?;
                table
                    .insert(trial_id, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(out)
        })
    }

    // ── Trials ─────────────────────────────────────────────────────

    /// Insert a new trial in `Ready` state.
    pub fn create_trial(&self, trial_id: TrialId, parameters: Vec<Parameter>) -> StateResult<()> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(TRIALS).map_err(map_err!(Table))?;
                if table.get(trial_id).map_err(map_err!(Read))?.is_some() {
                    return Err(StateError::AlreadyExists(trial_id));
                }
                let value = encode(&new_record(trial_id, parameters))?;
                table
                    .insert(trial_id, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(trial_id, "trial created");
            Ok(())
        })
    }

    /// Insert a new `Ready` trial under the next free id and return that id.
    pub fn allocate_trial(&self, parameters: Vec<Parameter>) -> StateResult<TrialId> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            let trial_id;
            {
                let mut table = txn.open_table(TRIALS).map_err(map_err!(Table))?;
                trial_id = match table.last().map_err(map_err!(Read))? {
                    Some((key, _)) => key.value() + 1,
                    None => 0,
                };
                let value = encode(&new_record(trial_id, parameters))?;
                table
                    .insert(trial_id, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(trial_id, "trial allocated");
            Ok(trial_id)
        })
    }

    pub fn get_trial(&self, trial_id: TrialId) -> StateResult<Option<TrialRecord>> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(TRIALS).map_err(map_err!(Table))?;
            match table.get(trial_id).map_err(map_err!(Read))? {
                Some(guard) => Ok(Some(decode(guard.value())?)),
                None => Ok(None),
            }
        })
    }

    /// All trials in ascending id order.
    pub fn list_trials(&self) -> StateResult<Vec<TrialRecord>> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(TRIALS).map_err(map_err!(Table))?;
            let mut results = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                results.push(decode(value.value())?);
            }
            Ok(results)
        })
    }

    pub fn max_trial_id(&self) -> StateResult<Option<TrialId>> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(TRIALS).map_err(map_err!(Table))?;
            Ok(table
                .last()
                .map_err(map_err!(Read))?
                .map(|(key, _)| key.value()))
        })
    }

    pub fn list_by_state(&self, state: TrialState) -> StateResult<Vec<TrialRecord>> {
        Ok(self
            .list_trials()?
            .into_iter()
            .filter(|t| t.state == state)
            .collect())
    }

    pub fn count_by_state(&self) -> StateResult<TrialCounts> {
        let mut counts = TrialCounts::default();
        for trial in self.list_trials()? {
            match trial.state {
                TrialState::Ready => counts.ready += 1,
                TrialState::Running => counts.running += 1,
                TrialState::Finished => counts.finished += 1,
                TrialState::Unknown => {}
            }
        }
        Ok(counts)
    }

    // ── Lifecycle state ────────────────────────────────────────────

    pub fn set_state(&self, trial_id: TrialId, state: TrialState) -> StateResult<()> {
        let previous = self.update_trial(trial_id, |t| std::mem::replace(&mut t.state, state))?;
        debug!(trial_id, %previous, %state, "trial state changed");
        Ok(())
    }

    /// Returns `Unknown` for a trial that does not exist.
    pub fn get_state(&self, trial_id: TrialId) -> StateResult<TrialState> {
        Ok(self
            .get_trial(trial_id)?
            .map(|t| t.state)
            .unwrap_or(TrialState::Unknown))
    }

    /// Set `state` only when the current state is one of `expected`.
    ///
    /// Returns whether the write happened.
    pub fn compare_and_set_state(
        &self,
        trial_id: TrialId,
        expected: &[TrialState],
        state: TrialState,
    ) -> StateResult<bool> {
        self.update_trial(trial_id, |t| {
            if expected.contains(&t.state) {
                t.state = state;
                true
            } else {
                false
            }
        })
    }

    // ── Job state ──────────────────────────────────────────────────

    pub fn set_jobstate(&self, trial_id: TrialId, jobstate: &str) -> StateResult<()> {
        self.update_trial(trial_id, |t| t.jobstate = Some(jobstate.to_string()))
    }

    pub fn get_jobstate(&self, trial_id: TrialId) -> StateResult<Option<String>> {
        Ok(self.get_trial(trial_id)?.and_then(|t| t.jobstate))
    }

    pub fn list_jobstates(&self) -> StateResult<Vec<(TrialId, String)>> {
        Ok(self
            .list_trials()?
            .into_iter()
            .filter_map(|t| t.jobstate.map(|js| (t.trial_id, js)))
            .collect())
    }

    // ── Results ────────────────────────────────────────────────────

    pub fn set_result(&self, trial_id: TrialId, result: TrialResult) -> StateResult<()> {
        let replaced = self.update_trial(trial_id, |t| t.result.replace(result).is_some())?;
        if replaced {
            warn!(trial_id, "trial result overwritten");
        }
        debug!(trial_id, "trial result stored");
        Ok(())
    }

    /// Forget a stale result before the trial runs again.
    pub fn clear_result(&self, trial_id: TrialId) -> StateResult<()> {
        self.update_trial(trial_id, |t| t.result = None)
    }

    pub fn get_result(&self, trial_id: TrialId) -> StateResult<Option<TrialResult>> {
        Ok(self.get_trial(trial_id)?.and_then(|t| t.result))
    }

    /// The stored objective vector, `None` until a result with values exists.
    pub fn get_objective(&self, trial_id: TrialId) -> StateResult<Option<Vec<f64>>> {
        Ok(self
            .get_result(trial_id)?
            .and_then(|r| r.objective))
    }

    // ── Cancellation ───────────────────────────────────────────────

    pub fn request_cancel(&self, trial_id: TrialId) -> StateResult<()> {
        self.update_trial(trial_id, |t| t.cancel_requested = true)?;
        debug!(trial_id, "cancel requested");
        Ok(())
    }

    /// Clear and return every pending cancel request.
    pub fn take_cancel_requests(&self) -> StateResult<Vec<TrialId>> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            let mut taken = Vec::new();
            {
                let mut table = txn.open_table(TRIALS).map_err(map_err!(Table))?;
                let mut pending = Vec::new();
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (_, value) = entry.map_err(map_err!(Read))?;
                    let record: TrialRecord = decode(value.value())?;
                    if record.cancel_requested {
                        pending.push(record);
                    }
                }
                for mut record in pending {
                    record.cancel_requested = false;
                    record.updated_at = epoch_secs();
                    let value = encode(&record)?;
                    table
                        .insert(record.trial_id, value.as_slice())
                        .map_err(map_err!(Write))?;
                    taken.push(record.trial_id);
                }
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(taken)
        })
    }

    /// Count one more expiry of the trial. Returns the new total.
    pub fn record_expiry(&self, trial_id: TrialId) -> StateResult<u32> {
        let count = self.update_trial(trial_id, |t| {
            t.expire_count += 1;
            t.expire_count
        })?;
        debug!(trial_id, count, "trial expiry recorded");
        Ok(count)
    }

    // ── Resume ─────────────────────────────────────────────────────

    /// Put a trial back to `Ready`, forgetting its job state and result.
    pub fn rollback_to_ready(&self, trial_id: TrialId) -> StateResult<()> {
        self.update_trial(trial_id, |t| {
            t.state = TrialState::Ready;
            t.jobstate = None;
            t.result = None;
            t.cancel_requested = false;
            t.expire_count = 0;
        })?;
        debug!(trial_id, "trial rolled back to ready");
        Ok(())
    }

    /// Delete every trial with an id greater than `trial_id`. Returns the count.
    pub fn delete_trials_after(&self, trial_id: TrialId) -> StateResult<u32> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            let mut count = 0u32;
            {
                let mut table = txn.open_table(TRIALS).map_err(map_err!(Table))?;
                let mut keys = Vec::new();
                for entry in table.range((trial_id + 1)..).map_err(map_err!(Read))? {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    keys.push(key.value());
                }
                for key in keys {
                    if table.remove(key).map_err(map_err!(Write))?.is_some() {
                        count += 1;
                    }
                }
            }
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(after = trial_id, count, "trials deleted");
            Ok(count)
        })
    }

    // ── Liveness ───────────────────────────────────────────────────

    pub fn set_liveness(&self, role: Role, alive: bool) -> StateResult<()> {
        let record = LivenessRecord {
            role,
            alive,
            pid: std::process::id(),
            updated_at: epoch_secs(),
        };
        let value = encode(&record)?;
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(LIVENESS).map_err(map_err!(Table))?;
                table
                    .insert(role.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(%role, alive, "liveness updated");
            Ok(())
        })
    }

    pub fn get_liveness(&self, role: Role) -> StateResult<Option<LivenessRecord>> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(LIVENESS).map_err(map_err!(Table))?;
            match table.get(role.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Ok(Some(decode(guard.value())?)),
                None => Ok(None),
            }
        })
    }

    pub fn is_alive(&self, role: Role) -> StateResult<bool> {
        Ok(self.get_liveness(role)?.is_some_and(|l| l.alive))
    }

    /// Mark every role as not alive.
    pub fn clear_liveness(&self) -> StateResult<()> {
        for role in Role::ALL {
            self.set_liveness(role, false)?;
        }
        Ok(())
    }

    // ── Verification ───────────────────────────────────────────────

    pub fn put_verification(&self, record: &VerificationRecord) -> StateResult<()> {
        let value = encode(record)?;
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(VERIFICATION).map_err(map_err!(Table))?;
                table
                    .insert(record.index, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(())
        })
    }

    /// Store `record` unless its condition already has an outcome.
    /// Returns whether it was inserted.
    pub fn put_verification_if_absent(&self, record: &VerificationRecord) -> StateResult<bool> {
        let value = encode(record)?;
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            let inserted;
            {
                let mut table = txn.open_table(VERIFICATION).map_err(map_err!(Table))?;
                inserted = table.get(record.index).map_err(map_err!(Read))?.is_none();
                if inserted {
                    table
                        .insert(record.index, value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(inserted)
        })
    }

    pub fn list_verification(&self) -> StateResult<Vec<VerificationRecord>> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(VERIFICATION).map_err(map_err!(Table))?;
            let mut results = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                results.push(decode(value.value())?);
            }
            Ok(results)
        })
    }

    pub fn clear_verification(&self) -> StateResult<()> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            txn.delete_table(VERIFICATION).map_err(map_err!(Table))?;
            txn.open_table(VERIFICATION).map_err(map_err!(Table))?;
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(())
        })
    }
}

/// Create all tables if they don't exist yet.
fn ensure_tables(db: &Database) -> StateResult<()> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    // Opening a table in a write transaction creates it if absent.
    txn.open_table(TRIALS).map_err(map_err!(Table))?;
    txn.open_table(LIVENESS).map_err(map_err!(Table))?;
    txn.open_table(VERIFICATION).map_err(map_err!(Table))?;
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(())
}

fn new_record(trial_id: TrialId, parameters: Vec<Parameter>) -> TrialRecord {
    let now = epoch_secs();
    TrialRecord {
        trial_id,
        state: TrialState::Ready,
        jobstate: None,
        parameters,
        result: None,
        cancel_requested: false,
        expire_count: 0,
        created_at: now,
        updated_at: now,
    }
}
