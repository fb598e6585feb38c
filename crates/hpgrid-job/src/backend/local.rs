//! Local execution: each trial is a direct child process of the scheduler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use hpgrid_core::{TrialId, Workspace, epoch_secs};
use hpgrid_state::{TrialRecord, TrialResult, TrialStore};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{JobBackend, shell_quote, trial_command_line};
use crate::error::{JobError, JobResult};
use crate::report::{last_non_empty_line, parse_objective, read_error_text, record_result};

/// A spawned trial process and the task watching it.
struct LocalProcess {
    kill_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

pub struct LocalBackend {
    job_command: String,
    config_path: PathBuf,
    workspace: Workspace,
    store: TrialStore,
    procs: Mutex<HashMap<TrialId, LocalProcess>>,
}

impl LocalBackend {
    pub fn new(
        job_command: String,
        config_path: PathBuf,
        workspace: Workspace,
        store: TrialStore,
    ) -> Self {
        Self {
            job_command,
            config_path,
            workspace,
            store,
            procs: Mutex::new(HashMap::new()),
        }
    }

    /// Kill a previous run of the trial and wait for its watcher to finish.
    async fn reap(&self, trial_id: TrialId) {
        let previous = self
            .procs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&trial_id);
        if let Some(mut proc) = previous {
            if let Some(tx) = proc.kill_tx.take() {
                let _ = tx.send(());
            }
            let _ = proc.task.await;
        }
    }
}

#[async_trait]
impl JobBackend for LocalBackend {
    async fn create_runner(&self, trial: &TrialRecord) -> JobResult<PathBuf> {
        let path = self.workspace.runner_file(trial.trial_id);
        let line: Vec<String> = trial_command_line(&self.job_command, trial, &self.config_path)
            .iter()
            .map(|arg| shell_quote(arg))
            .collect();
        let script = format!("#!/bin/sh\nexec {}\n", line.join(" "));
        tokio::fs::write(&path, script)
            .await
            .map_err(|e| JobError::io("write", &path, e))?;
        debug!(trial_id = trial.trial_id, ?path, "runner script written");
        Ok(path)
    }

    async fn runner_exists(&self, trial_id: TrialId) -> JobResult<bool> {
        let path = self.workspace.runner_file(trial_id);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| JobError::io("stat", path, e))
    }

    async fn submit(&self, trial: &TrialRecord) -> JobResult<()> {
        let trial_id = trial.trial_id;
        if self.is_active(trial_id).await? {
            warn!(trial_id, "previous run still active, killing it");
        }
        self.reap(trial_id).await;

        let args = trial_command_line(&self.job_command, trial, &self.config_path);
        let (program, rest) = args.split_first().ok_or(JobError::EmptyCommand)?;

        let error_path = self.workspace.error_file(trial_id);
        let stderr = std::fs::File::create(&error_path)
            .map_err(|e| JobError::io("create", &error_path, e))?;

        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| JobError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let (kill_tx, kill_rx) = oneshot::channel();
        let watched = WatchedProcess {
            trial_id,
            child,
            stdout,
            kill_rx,
            store: self.store.clone(),
            stdout_path: self.workspace.stdout_file(trial_id),
            error_path,
            start_time: epoch_secs(),
        };
        let task = tokio::spawn(watch_process(watched));

        self.procs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                trial_id,
                LocalProcess {
                    kill_tx: Some(kill_tx),
                    task,
                },
            );
        info!(trial_id, %program, "trial process started");
        Ok(())
    }

    async fn is_active(&self, trial_id: TrialId) -> JobResult<bool> {
        let procs = self.procs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(procs
            .get(&trial_id)
            .is_some_and(|proc| !proc.task.is_finished()))
    }

    async fn kill(&self, trial_id: TrialId) -> JobResult<()> {
        let mut procs = self.procs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = procs.get_mut(&trial_id).and_then(|p| p.kill_tx.take()) {
            let _ = tx.send(());
            debug!(trial_id, "kill requested");
        }
        Ok(())
    }

    async fn poll_status(&self) -> JobResult<()> {
        let mut procs = self.procs.lock().unwrap_or_else(PoisonError::into_inner);
        procs.retain(|trial_id, proc| {
            let done = proc.task.is_finished();
            if done {
                debug!(trial_id, "trial process reaped");
            }
            !done
        });
        Ok(())
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        let procs = self.procs.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, proc) in procs.drain() {
            // Dropping the child inside the task kills the process.
            proc.task.abort();
        }
    }
}

struct WatchedProcess {
    trial_id: TrialId,
    child: Child,
    stdout: Option<ChildStdout>,
    kill_rx: oneshot::Receiver<()>,
    store: TrialStore,
    stdout_path: PathBuf,
    error_path: PathBuf,
    start_time: u64,
}

/// Wait for a trial process to exit (or be killed) and record its result.
async fn watch_process(mut p: WatchedProcess) {
    let trial_id = p.trial_id;
    let reader = p
        .stdout
        .take()
        .map(|out| tokio::spawn(drain_stdout(trial_id, out, p.stdout_path.clone())));

    let status = tokio::select! {
        status = p.child.wait() => status,
        _ = &mut p.kill_rx => {
            if let Err(e) = p.child.kill().await {
                warn!(trial_id, error = %e, "failed to kill trial process");
            }
            if let Some(reader) = reader {
                reader.abort();
            }
            info!(trial_id, "trial process killed");
            return;
        }
    };

    let last_line = match reader {
        Some(reader) => reader.await.ok().flatten(),
        None => None,
    };

    let (exit_status, exit_error) = match &status {
        Ok(status) => (status.code(), (!status.success()).then(|| format!("process {status}"))),
        Err(e) => (None, Some(format!("failed to wait for process: {e}"))),
    };
    let objective = last_line.as_deref().and_then(parse_objective);
    let error = read_error_text(&p.error_path).or(exit_error);

    info!(trial_id, ?exit_status, has_objective = objective.is_some(), "trial process exited");

    let result = TrialResult {
        objective,
        error,
        start_time: Some(p.start_time),
        end_time: Some(epoch_secs()),
        exit_status,
    };
    if let Err(e) = record_result(&p.store, trial_id, result) {
        warn!(trial_id, error = %e, "failed to record trial result");
    }
}

/// Copy the process's stdout to its per-trial file and keep the last non-empty line.
async fn drain_stdout(trial_id: TrialId, stdout: ChildStdout, path: PathBuf) -> Option<String> {
    let mut file = match tokio::fs::File::create(&path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(trial_id, ?path, error = %e, "cannot create stdout file");
            None
        }
    };

    let mut lines = BufReader::new(stdout).lines();
    let mut last = None;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(f) = file.as_mut() {
                    if let Err(e) = f.write_all(format!("{line}\n").as_bytes()).await {
                        warn!(trial_id, error = %e, "stdout write failed");
                        file = None;
                    }
                }
                if let Some(trimmed) = last_non_empty_line(&line) {
                    last = Some(trimmed.to_string());
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(trial_id, error = %e, "stdout read failed");
                break;
            }
        }
    }
    if let Some(mut f) = file {
        let _ = f.flush().await;
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpgrid_core::{ParamValue, Parameter, ParameterKind};
    use std::time::Duration;

    fn setup(command: &str) -> (tempfile::TempDir, TrialStore, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path().join("work"), 6);
        ws.create().unwrap();
        let store = TrialStore::open_in_memory().unwrap();
        let backend = LocalBackend::new(
            command.to_string(),
            dir.path().join("hpgrid.toml"),
            ws,
            store.clone(),
        );
        (dir, store, backend)
    }

    fn trial(store: &TrialStore, x: f64) -> TrialRecord {
        let id = store
            .allocate_trial(vec![Parameter::new(
                "x1",
                ParameterKind::UniformFloat,
                ParamValue::Float(x),
            )])
            .unwrap();
        store.get_trial(id).unwrap().unwrap()
    }

    fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        format!("sh {}", path.display())
    }

    async fn wait_inactive(backend: &LocalBackend, trial_id: TrialId) {
        for _ in 0..200 {
            if !backend.is_active(trial_id).await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("trial {trial_id} still active");
    }

    #[tokio::test]
    async fn runner_script_is_written() {
        let (_dir, store, backend) = setup("python train.py");
        let trial = trial(&store, 0.5);
        assert!(!backend.runner_exists(trial.trial_id).await.unwrap());

        let path = backend.create_runner(&trial).await.unwrap();
        assert!(backend.runner_exists(trial.trial_id).await.unwrap());
        let script = std::fs::read_to_string(path).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("exec python train.py --x1=0.5 --trial_id=0"));
    }

    #[tokio::test]
    async fn objective_is_recorded_from_last_line() {
        let (dir, store, _) = setup("unused");
        let command = write_script(
            &dir,
            "obj.sh",
            "for a in \"$@\"; do case \"$a\" in --x1=*) x=\"${a#--x1=}\";; esac; done\necho training\necho \"$x\"\necho\n",
        );
        let backend = LocalBackend::new(
            command,
            dir.path().join("hpgrid.toml"),
            Workspace::new(dir.path().join("work"), 6),
            store.clone(),
        );
        let trial = trial(&store, 0.25);

        backend.submit(&trial).await.unwrap();
        wait_inactive(&backend, trial.trial_id).await;

        let result = store.get_result(trial.trial_id).unwrap().unwrap();
        assert_eq!(result.objective, Some(vec![0.25]));
        assert_eq!(result.exit_status, Some(0));
        let stdout = std::fs::read_to_string(dir.path().join("work/stdout/000000.txt")).unwrap();
        assert!(stdout.starts_with("training\n"));
    }

    #[tokio::test]
    async fn failing_command_records_error() {
        let (dir, store, _) = setup("unused");
        let command = write_script(&dir, "fail.sh", "echo boom >&2\nexit 3\n");
        let backend = LocalBackend::new(
            command,
            dir.path().join("hpgrid.toml"),
            Workspace::new(dir.path().join("work"), 6),
            store.clone(),
        );
        let trial = trial(&store, 1.0);

        backend.submit(&trial).await.unwrap();
        wait_inactive(&backend, trial.trial_id).await;

        let result = store.get_result(trial.trial_id).unwrap().unwrap();
        assert_eq!(result.objective, None);
        assert_eq!(result.exit_status, Some(3));
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn kill_stops_process_without_result() {
        let (dir, store, _) = setup("unused");
        let command = write_script(&dir, "slow.sh", "sleep 30\necho 1\n");
        let backend = LocalBackend::new(
            command,
            dir.path().join("hpgrid.toml"),
            Workspace::new(dir.path().join("work"), 6),
            store.clone(),
        );
        let trial = trial(&store, 1.0);

        backend.submit(&trial).await.unwrap();
        assert!(backend.is_active(trial.trial_id).await.unwrap());

        backend.kill(trial.trial_id).await.unwrap();
        wait_inactive(&backend, trial.trial_id).await;
        assert!(store.get_result(trial.trial_id).unwrap().is_none());

        backend.poll_status().await.unwrap();
        assert!(!backend.is_active(trial.trial_id).await.unwrap());
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let (_dir, store, backend) = setup("/nonexistent/hpgrid-test-binary");
        let trial = trial(&store, 1.0);
        let err = backend.submit(&trial).await.unwrap_err();
        assert!(matches!(err, JobError::Spawn { .. }));
    }
}
