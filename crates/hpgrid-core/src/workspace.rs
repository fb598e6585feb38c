//! On-disk workspace layout of a run.
//!
//! ```text
//! <workspace>/
//!   storage/storage.redb     trial store
//!   runner/run_<id>.sh       rendered batch scripts
//!   stdout/<id>.txt          captured trial stdout
//!   error/<id>.txt           trial stderr / reported error text
//!   result/<id>.json         per-trial result artifact
//!   result/final_result.json best trial(s) of the run
//!   verification/            verification report
//!   abci_output/             batch system output files
//! ```

use std::io;
use std::path::{Path, PathBuf};

use crate::types::{TrialId, format_trial_id};

const SUBDIRS: [&str; 7] = [
    "storage",
    "runner",
    "stdout",
    "error",
    "result",
    "verification",
    "abci_output",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
    name_length: usize,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, name_length: usize) -> Self {
        Self {
            root: root.into(),
            name_length,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Create the workspace root and every role subdirectory.
    pub fn create(&self) -> io::Result<()> {
        for dir in SUBDIRS {
            std::fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(())
    }

    /// Remove the whole workspace tree, if present.
    pub fn clean(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub fn padded(&self, trial_id: TrialId) -> String {
        format_trial_id(trial_id, self.name_length)
    }

    pub fn storage_file(&self) -> PathBuf {
        self.root.join("storage").join("storage.redb")
    }

    pub fn runner_file(&self, trial_id: TrialId) -> PathBuf {
        self.root
            .join("runner")
            .join(format!("run_{}.sh", self.padded(trial_id)))
    }

    pub fn stdout_file(&self, trial_id: TrialId) -> PathBuf {
        self.root
            .join("stdout")
            .join(format!("{}.txt", self.padded(trial_id)))
    }

    pub fn error_file(&self, trial_id: TrialId) -> PathBuf {
        self.root
            .join("error")
            .join(format!("{}.txt", self.padded(trial_id)))
    }

    pub fn result_file(&self, trial_id: TrialId) -> PathBuf {
        self.root
            .join("result")
            .join(format!("{}.json", self.padded(trial_id)))
    }

    pub fn final_result_file(&self) -> PathBuf {
        self.root.join("result").join("final_result.json")
    }

    pub fn verification_file(&self) -> PathBuf {
        self.root.join("verification").join("verification.json")
    }

    pub fn abci_output_file(&self, trial_id: TrialId) -> PathBuf {
        self.root
            .join("abci_output")
            .join(format!("{}.o", self.padded(trial_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_use_padded_ids() {
        let ws = Workspace::new("/tmp/work", 4);
        assert_eq!(
            ws.runner_file(12),
            PathBuf::from("/tmp/work/runner/run_0012.sh")
        );
        assert_eq!(
            ws.result_file(3),
            PathBuf::from("/tmp/work/result/0003.json")
        );
        assert_eq!(
            ws.storage_file(),
            PathBuf::from("/tmp/work/storage/storage.redb")
        );
    }

    #[test]
    fn create_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path().join("work"), 6);
        assert!(!ws.exists());

        ws.create().unwrap();
        assert!(ws.exists());
        for sub in SUBDIRS {
            assert!(ws.root().join(sub).is_dir(), "{sub} missing");
        }

        ws.clean().unwrap();
        assert!(!ws.exists());
        // Cleaning an absent workspace is a no-op.
        ws.clean().unwrap();
    }
}
