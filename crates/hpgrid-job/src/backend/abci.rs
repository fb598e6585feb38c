//! Grid-engine execution (ABCI): trials are batch jobs submitted with `qsub`.
//!
//! The rendered runner script runs the trial command and then reports its
//! outcome through `hpgrid set-result`, so the result reaches the store
//! from the compute node.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use hpgrid_core::config::AbciConfig;
use hpgrid_core::{TrialId, Workspace};
use hpgrid_state::TrialRecord;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::qstat::{QstatParser, QstatRecord};
use super::{JobBackend, shell_quote, trial_command_line};
use crate::error::{JobError, JobResult};

struct Submitted {
    job_id: Option<String>,
    at: Instant,
}

#[derive(Default)]
struct ClusterView {
    /// Jobs listed by the last successful status poll, by trial id.
    jobs: HashMap<TrialId, QstatRecord>,
    submitted: HashMap<TrialId, Submitted>,
    /// Start of the last successful status poll.
    polled_at: Option<Instant>,
}

pub struct AbciBackend {
    config: AbciConfig,
    job_command: String,
    config_path: PathBuf,
    workspace: Workspace,
    hpgrid_exe: PathBuf,
    parser: QstatParser,
    view: Mutex<ClusterView>,
}

impl AbciBackend {
    pub fn new(
        config: AbciConfig,
        job_command: String,
        config_path: PathBuf,
        workspace: Workspace,
    ) -> JobResult<Self> {
        let hpgrid_exe = std::env::current_exe()
            .map_err(|e| JobError::io("resolve", "current executable", e))?;
        Ok(Self {
            config,
            job_command,
            config_path,
            workspace,
            hpgrid_exe,
            parser: QstatParser::new()?,
            view: Mutex::new(ClusterView::default()),
        })
    }

    /// Override the binary invoked by rendered scripts to report results.
    pub fn with_hpgrid_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.hpgrid_exe = exe.into();
        self
    }

    /// Render the batch script of one trial.
    pub fn render_script(&self, trial: &TrialRecord, preamble: &str) -> String {
        let trial_id = trial.trial_id;
        let command: Vec<String> = trial_command_line(&self.job_command, trial, &self.config_path)
            .iter()
            .map(|arg| shell_quote(arg))
            .collect();
        let stdout = self.workspace.stdout_file(trial_id);
        let error = self.workspace.error_file(trial_id);
        let quote_path = |p: &std::path::Path| shell_quote(&p.display().to_string());

        let mut script = String::new();
        script.push_str(preamble.trim_end());
        script.push_str("\n\n");
        script.push_str("start_time=$(date +%s)\n");
        script.push_str(&format!(
            "{} > {} 2> {}\n",
            command.join(" "),
            quote_path(&stdout),
            quote_path(&error)
        ));
        script.push_str("exit_status=$?\n");
        script.push_str("end_time=$(date +%s)\n");
        script.push_str(&format!(
            "objective=$(grep -v '^[[:space:]]*$' {} | tail -n 1)\n",
            quote_path(&stdout)
        ));
        script.push_str(&format!(
            "{} set-result --config {} --trial-id {} --start-time \"$start_time\" \
             --end-time \"$end_time\" --exit-status \"$exit_status\" \
             --objective \"$objective\" --error-file {}\n",
            quote_path(&self.hpgrid_exe),
            quote_path(&self.config_path),
            trial_id,
            quote_path(&error)
        ));
        script
    }

    /// Arguments of the submit command for a rendered script.
    pub fn submit_args(&self, trial_id: TrialId) -> Vec<String> {
        let mut args = vec![
            "-g".to_string(),
            self.config.group.clone(),
            "-j".to_string(),
            "y".to_string(),
            "-o".to_string(),
            self.workspace.abci_output_file(trial_id).display().to_string(),
        ];
        args.extend(self.config.job_execution_options.iter().cloned());
        args.push(self.workspace.runner_file(trial_id).display().to_string());
        args
    }

    fn job_id(&self, trial_id: TrialId) -> Option<String> {
        let view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
        view.jobs
            .get(&trial_id)
            .map(|r| r.job_id.clone())
            .or_else(|| view.submitted.get(&trial_id).and_then(|s| s.job_id.clone()))
    }

    /// Replace the cached job list with a fresh status poll.
    fn apply_poll(&self, jobs: Vec<QstatRecord>, started: Instant) {
        let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
        view.jobs = jobs
            .into_iter()
            .filter_map(|job| Some((job.trial_id()?, job)))
            .collect();
        view.polled_at = Some(started);
        let listed: Vec<TrialId> = view.jobs.keys().copied().collect();
        view.submitted
            .retain(|id, s| !listed.contains(id) && s.at > started);
    }
}

/// Run a cluster command. The configured command may carry leading
/// arguments (`ssh login qsub`).
async fn run_command(command: &str, args: &[String]) -> JobResult<String> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or(JobError::EmptyCommand)?;
    let output = Command::new(program)
        .args(parts)
        .args(args)
        .output()
        .await
        .map_err(|source| JobError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(JobError::CommandFailed {
            command: command.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl JobBackend for AbciBackend {
    async fn create_runner(&self, trial: &TrialRecord) -> JobResult<PathBuf> {
        let preamble_path = &self.config.job_script_preamble;
        let preamble = tokio::fs::read_to_string(preamble_path)
            .await
            .map_err(|e| JobError::io("read", preamble_path, e))?;
        let path = self.workspace.runner_file(trial.trial_id);
        tokio::fs::write(&path, self.render_script(trial, &preamble))
            .await
            .map_err(|e| JobError::io("write", &path, e))?;
        debug!(trial_id = trial.trial_id, ?path, "batch script rendered");
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
            warn!(trial_id, "previous batch job still listed, deleting it");
            self.kill(trial_id).await?;
        }

        let args = self.submit_args(trial_id);
        let output = run_command(&self.config.submit_command, &args).await?;
        let job_id = self.parser.parse_submitted(&output);
        if job_id.is_none() {
            warn!(trial_id, %output, "could not read job id from submit output");
        }
        info!(trial_id, job_id = ?job_id, "batch job submitted");

        let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
        view.jobs.remove(&trial_id);
        view.submitted.insert(
            trial_id,
            Submitted {
                job_id,
                at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn is_active(&self, trial_id: TrialId) -> JobResult<bool> {
        let view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
        if view.jobs.contains_key(&trial_id) {
            return Ok(true);
        }
        // Submitted after the last poll started: not visible in qstat yet.
        Ok(view
            .submitted
            .get(&trial_id)
            .is_some_and(|s| view.polled_at.is_none_or(|polled| s.at > polled)))
    }

    async fn kill(&self, trial_id: TrialId) -> JobResult<()> {
        let Some(job_id) = self.job_id(trial_id) else {
            debug!(trial_id, "no batch job to delete");
            return Ok(());
        };
        run_command(&self.config.delete_command, &[job_id.clone()]).await?;
        info!(trial_id, %job_id, "batch job deleted");
        Ok(())
    }

    async fn poll_status(&self) -> JobResult<()> {
        let args = ["-xml".to_string()];
        let attempts = self.config.status_retry.max(1);
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            match run_command(&self.config.status_command, &args).await {
                Ok(xml) => {
                    let jobs = self.parser.parse_jobs(&xml);
                    debug!(jobs = jobs.len(), "cluster status polled");
                    self.apply_poll(jobs, started);
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "status query failed, retrying");
                    tokio::time::sleep(self.config.status_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpgrid_core::{ParamValue, Parameter, ParameterKind, TrialState};
    use std::time::Duration;

    fn fake_command(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("{body}\n")).unwrap();
        format!("sh {}", path.display())
    }

    fn backend(dir: &std::path::Path, submit: &str, status: &str, delete: &str) -> AbciBackend {
        let preamble = dir.join("preamble.sh");
        std::fs::write(&preamble, "#!/bin/bash\n#$ -l rt_F=1\n").unwrap();
        let ws = Workspace::new(dir.join("work"), 6);
        ws.create().unwrap();
        let config = AbciConfig {
            group: "gaa01".into(),
            job_script_preamble: preamble,
            job_execution_options: vec!["-l".into(), "h_rt=1:00:00".into()],
            submit_command: submit.into(),
            status_command: status.into(),
            delete_command: delete.into(),
            status_retry: 2,
            status_retry_delay: Duration::from_millis(10),
        };
        AbciBackend::new(config, "python train.py".into(), dir.join("hpgrid.toml"), ws)
            .unwrap()
            .with_hpgrid_exe("/opt/bin/hpgrid")
    }

    fn trial(id: TrialId) -> TrialRecord {
        TrialRecord {
            trial_id: id,
            state: TrialState::Ready,
            jobstate: None,
            parameters: vec![Parameter::new(
                "x1",
                ParameterKind::UniformFloat,
                ParamValue::Float(1.5),
            )],
            result: None,
            cancel_requested: false,
            expire_count: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn script_has_preamble_command_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), "qsub", "qstat", "qdel");

        let path = backend.create_runner(&trial(3)).await.unwrap();
        assert!(backend.runner_exists(3).await.unwrap());
        let script = std::fs::read_to_string(path).unwrap();

        assert!(script.starts_with("#!/bin/bash\n#$ -l rt_F=1\n"));
        assert!(script.contains("python train.py --x1=1.5 --trial_id=3 --config="));
        assert!(script.contains("stdout/000003.txt 2> "));
        assert!(script.contains("/opt/bin/hpgrid set-result --config "));
        assert!(script.contains("--trial-id 3 "));
    }

    #[test]
    fn submit_line_layout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), "qsub", "qstat", "qdel");
        let args = backend.submit_args(3);
        assert_eq!(&args[..5], &["-g", "gaa01", "-j", "y", "-o"]);
        assert!(args[5].ends_with("abci_output/000003.o"));
        assert_eq!(&args[6..8], &["-l", "h_rt=1:00:00"]);
        assert!(args[8].ends_with("runner/run_000003.sh"));
    }

    #[tokio::test]
    async fn submitted_job_is_active_until_poll_drops_it() {
        let dir = tempfile::tempdir().unwrap();
        let submit = fake_command(
            dir.path(),
            "fake_qsub",
            "echo 'Your job 777 (\"run_000003.sh\") has been submitted'",
        );
        let status = fake_command(dir.path(), "fake_qstat", "echo '<job_info></job_info>'");
        let delete = fake_command(dir.path(), "fake_qdel", "exit 0");
        let backend = backend(dir.path(), &submit, &status, &delete);

        backend.submit(&trial(3)).await.unwrap();
        assert!(backend.is_active(3).await.unwrap());
        assert_eq!(backend.job_id(3).as_deref(), Some("777"));

        backend.poll_status().await.unwrap();
        assert!(!backend.is_active(3).await.unwrap());
    }

    #[tokio::test]
    async fn poll_lists_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let status = fake_command(
            dir.path(),
            "fake_qstat",
            "cat <<'XML'\n<job_info><queue_info><job_list state=\"running\">\
             <JB_job_number>42</JB_job_number><JB_name>run_000005.sh</JB_name>\
             <state>r</state></job_list></queue_info></job_info>\nXML",
        );
        let backend = backend(dir.path(), "qsub", &status, "qdel");

        backend.poll_status().await.unwrap();
        assert!(backend.is_active(5).await.unwrap());
        assert!(!backend.is_active(6).await.unwrap());
        assert_eq!(backend.job_id(5).as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn failing_status_query_is_retried_then_reported() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("calls");
        let status = fake_command(
            dir.path(),
            "fake_qstat",
            &format!("echo x >> {}\nexit 1", counter.display()),
        );
        let backend = backend(dir.path(), "qsub", &status, "qdel");

        let err = backend.poll_status().await.unwrap_err();
        assert!(matches!(err, JobError::CommandFailed { .. }));
        let calls = std::fs::read_to_string(counter).unwrap();
        assert_eq!(calls.lines().count(), 2);
    }
}
