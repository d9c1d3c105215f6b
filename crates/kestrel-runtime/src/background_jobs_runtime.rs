//! Detached background jobs and their persisted, reconciled status.
//!
//! A job is a shell command wrapped by a small `sh` script that records the
//! exit code in a status file (written by atomic rename) when the command
//! ends. The controller never waits on the job; status is recomputed from OS
//! liveness and the status file whenever the store is read.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use kestrel_core::{
    append_line_with_rotation, current_unix_timestamp_ms, current_utc_rfc3339,
    load_json_document, update_json_document, update_json_document_async, LogRotationPolicy,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::approval_gate::{ApprovalDecision, ApprovalGate, ApprovalRequest};
use crate::process_spawn_runtime::{
    is_process_alive, send_signal, shell_program, spawn_process, ProcessOutput, ProcessSignal,
    ProcessSpawnSpec, SignalTarget,
};
use crate::workspace_layout::resolve_against;

const BACKGROUND_JOB_STORE_FILE: &str = "jobs.json";
const BACKGROUND_JOB_EVENT_LOG_FILE: &str = "events.jsonl";
const BACKGROUND_JOB_OUTPUT_LOG_FILE: &str = "output.log";
const BACKGROUND_JOB_STATUS_FILE: &str = "status.json";
const BACKGROUND_JOB_ID_PREFIX: &str = "job";
const BACKGROUND_JOB_ID_SUFFIX_LEN: usize = 6;
const BACKGROUND_JOB_WRAPPER_SHELL: &str = "sh";
pub const BACKGROUND_JOB_DEFAULT_LOG_TAIL_BYTES: usize = 4_096;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundJobStatus {
    Running,
    Completed,
    Failed,
    Stopped,
    /// The process is gone and left no status file.
    Unknown,
}

impl BackgroundJobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Terminal states that should alert an operator.
    pub fn is_failure_shaped(self) -> bool {
        matches!(self, Self::Failed | Self::Unknown)
    }
}

/// Persisted job record. `pid` is not trusted once the job is terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackgroundJobRecord {
    pub id: String,
    pub command: String,
    pub cwd: PathBuf,
    pub pid: u32,
    #[serde(alias = "startedAt")]
    pub started_at: String,
    #[serde(default, alias = "endedAt", skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(default, alias = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub status: BackgroundJobStatus,
    #[serde(alias = "logPath")]
    pub log_path: PathBuf,
    #[serde(alias = "statusPath")]
    pub status_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackgroundJobsState {
    #[serde(default)]
    pub jobs: std::collections::BTreeMap<String, BackgroundJobRecord>,
}

/// Contents of the status file written by the job wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundJobStatusFile {
    pub exit_code: i32,
    pub ended_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBackgroundJobStatusFile {
    #[serde(alias = "exitCode")]
    exit_code: serde_json::Value,
    #[serde(default, alias = "endedAt")]
    ended_at: Option<String>,
}

/// Parses a status file; `None` unless it carries an integral exit code.
pub fn parse_background_job_status_file(raw: &str) -> Option<BackgroundJobStatusFile> {
    let parsed = serde_json::from_str::<RawBackgroundJobStatusFile>(raw.trim()).ok()?;
    let exit_code = parsed
        .exit_code
        .as_i64()
        .and_then(|code| i32::try_from(code).ok())?;
    let ended_at = parsed
        .ended_at
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    Some(BackgroundJobStatusFile {
        exit_code,
        ended_at,
    })
}

fn read_background_job_status_file(path: &Path) -> Option<BackgroundJobStatusFile> {
    let raw = std::fs::read_to_string(path).ok()?;
    parse_background_job_status_file(&raw)
}

/// OS liveness seam so reconciliation can be exercised without real pids.
pub trait ProcessLivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessLivenessProbe;

impl ProcessLivenessProbe for OsProcessLivenessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }
}

impl<F> ProcessLivenessProbe for F
where
    F: Fn(u32) -> bool + Send + Sync,
{
    fn is_alive(&self, pid: u32) -> bool {
        self(pid)
    }
}

/// Recomputes one job's status from liveness and status-file evidence.
///
/// Terminal records come back unchanged, so reconciling twice is a no-op.
pub fn reconcile_background_job(
    record: &BackgroundJobRecord,
    probe: &dyn ProcessLivenessProbe,
    now: &str,
) -> BackgroundJobRecord {
    if record.status != BackgroundJobStatus::Running {
        return record.clone();
    }
    if probe.is_alive(record.pid) {
        return record.clone();
    }
    let mut reconciled = record.clone();
    match read_background_job_status_file(&record.status_path) {
        Some(status_file) => {
            reconciled.status = if status_file.exit_code == 0 {
                BackgroundJobStatus::Completed
            } else {
                BackgroundJobStatus::Failed
            };
            reconciled.exit_code = Some(status_file.exit_code);
            reconciled.ended_at = Some(status_file.ended_at.unwrap_or_else(|| now.to_string()));
        }
        None => {
            reconciled.status = BackgroundJobStatus::Unknown;
            if reconciled.ended_at.is_none() {
                reconciled.ended_at = Some(now.to_string());
            }
        }
    }
    reconciled
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundJobRuntimeConfig {
    /// Directory holding `jobs.json`, `events.jsonl` and one dir per job.
    pub state_dir: PathBuf,
    pub shell: String,
    /// Used when a request has no cwd; relative request cwds are joined onto it.
    pub default_cwd: PathBuf,
}

impl Default for BackgroundJobRuntimeConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".kestrel/jobs"),
            shell: shell_program(),
            default_cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundJobRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl BackgroundJobRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundLaunchOutcome {
    Started(BackgroundJobRecord),
    Denied { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackgroundJobStopReport {
    pub job: BackgroundJobRecord,
    pub signal_sent: bool,
}

/// A status change observed while reconciling the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackgroundJobTransition {
    pub id: String,
    pub from: BackgroundJobStatus,
    pub to: BackgroundJobStatus,
}

#[derive(Debug, Clone, Serialize)]
struct BackgroundJobEventRecord {
    timestamp_unix_ms: u64,
    job_id: String,
    event: String,
    status: String,
    detail: String,
}

/// Launcher and store for detached background jobs.
#[derive(Clone)]
pub struct BackgroundJobRuntime {
    config: BackgroundJobRuntimeConfig,
    gate: Arc<dyn ApprovalGate>,
    probe: Arc<dyn ProcessLivenessProbe>,
}

impl BackgroundJobRuntime {
    pub fn new(config: BackgroundJobRuntimeConfig, gate: Arc<dyn ApprovalGate>) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("failed to create {}", config.state_dir.display()))?;
        Ok(Self {
            config,
            gate,
            probe: Arc::new(OsProcessLivenessProbe),
        })
    }

    /// Replaces the OS liveness probe.
    pub fn with_probe(mut self, probe: Arc<dyn ProcessLivenessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn state_dir(&self) -> &Path {
        self.config.state_dir.as_path()
    }

    pub fn store_path(&self) -> PathBuf {
        self.config.state_dir.join(BACKGROUND_JOB_STORE_FILE)
    }

    pub fn events_path(&self) -> PathBuf {
        self.config.state_dir.join(BACKGROUND_JOB_EVENT_LOG_FILE)
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.config.state_dir.join(job_id)
    }

    /// Launches a detached job and returns without waiting for it.
    ///
    /// Spawn failures surface as [`crate::ProcessRuntimeError::SpawnFailure`]
    /// inside the error chain and leave no record behind.
    pub async fn start_job(&self, request: &BackgroundJobRequest) -> Result<BackgroundLaunchOutcome> {
        let cwd = request.cwd.as_deref().map_or_else(
            || self.config.default_cwd.clone(),
            |dir| resolve_against(&self.config.default_cwd, dir),
        );
        let approval = ApprovalRequest::start_background_job(&request.command, cwd.clone());
        if let ApprovalDecision::Denied { reason } = self.gate.review(&approval).await {
            tracing::info!(
                command = %request.command,
                reason = %reason,
                "background job denied"
            );
            return Ok(BackgroundLaunchOutcome::Denied { reason });
        }

        let store_path = self.store_path();
        let record = update_json_document_async::<BackgroundJobsState, _, _>(&store_path, |state| {
            let job_id = allocate_background_job_id(state);
            let job_dir = self.job_dir(&job_id);
            std::fs::create_dir_all(&job_dir)
                .with_context(|| format!("failed to create {}", job_dir.display()))?;
            let log_path = job_dir.join(BACKGROUND_JOB_OUTPUT_LOG_FILE);
            let status_path = job_dir.join(BACKGROUND_JOB_STATUS_FILE);
            let script = build_background_job_wrapper_script(
                &self.config.shell,
                &request.command,
                &status_path,
            );
            let spec = ProcessSpawnSpec::new(BACKGROUND_JOB_WRAPPER_SHELL)
                .with_args(["-c".to_string(), script])
                .with_cwd(&cwd)
                .with_output(ProcessOutput::AppendToLog(log_path.clone()))
                .detached();
            let process = match spawn_process(&spec) {
                Ok(process) => process,
                Err(error) => {
                    let _ = std::fs::remove_dir_all(&job_dir);
                    return Err(anyhow::Error::new(error)).with_context(|| {
                        format!("failed to start background job `{}`", request.command)
                    });
                }
            };
            let record = BackgroundJobRecord {
                id: job_id.clone(),
                command: request.command.clone(),
                cwd: cwd.clone(),
                pid: process.pid(),
                started_at: current_utc_rfc3339(),
                ended_at: None,
                exit_code: None,
                status: BackgroundJobStatus::Running,
                log_path,
                status_path,
            };
            process.spawn_reaper();
            state.jobs.insert(job_id, record.clone());
            Ok((record, true))
        })
        .await?;

        tracing::info!(
            job_id = %record.id,
            pid = record.pid,
            command = %record.command,
            "background job started"
        );
        self.append_event(&record, "started", "background job launched");
        Ok(BackgroundLaunchOutcome::Started(record))
    }

    /// Every job, reconciled, newest first.
    pub fn list_jobs(&self) -> Result<Vec<BackgroundJobRecord>> {
        let (mut jobs, _) = self.reconcile_store()?;
        jobs.sort_by(|left, right| {
            right
                .started_at
                .cmp(&left.started_at)
                .then_with(|| right.id.cmp(&left.id))
        });
        Ok(jobs)
    }

    /// Reconciles every job and reports the status changes it caused.
    pub fn reconcile_all(&self) -> Result<Vec<BackgroundJobTransition>> {
        let (_, transitions) = self.reconcile_store()?;
        Ok(transitions)
    }

    pub fn job_status(&self, job_id: &str) -> Result<Option<BackgroundJobRecord>> {
        let store_path = self.store_path();
        if !store_path.exists() {
            return Ok(None);
        }
        let now = current_utc_rfc3339();
        let probe = Arc::clone(&self.probe);
        let outcome = update_json_document::<BackgroundJobsState, _, _>(&store_path, |state| {
            let Some(current) = state.jobs.get(job_id) else {
                return Ok((None, false));
            };
            let reconciled = reconcile_background_job(current, probe.as_ref(), &now);
            let changed = &reconciled != current;
            let previous = current.status;
            if changed {
                state.jobs.insert(job_id.to_string(), reconciled.clone());
            }
            Ok((Some((reconciled, previous, changed)), changed))
        })?;
        Ok(outcome.map(|(record, previous, changed)| {
            if changed {
                self.log_transition(&record, previous);
            }
            record
        }))
    }

    /// Sends `SIGTERM` to a running job's process group and marks it stopped.
    ///
    /// The job is marked without waiting for it to exit. Terminal jobs are
    /// returned unchanged with `signal_sent = false`.
    pub fn stop_job(&self, job_id: &str) -> Result<Option<BackgroundJobStopReport>> {
        let store_path = self.store_path();
        if !store_path.exists() {
            return Ok(None);
        }
        let now = current_utc_rfc3339();
        let probe = Arc::clone(&self.probe);
        let outcome = update_json_document::<BackgroundJobsState, _, _>(&store_path, |state| {
            let Some(current) = state.jobs.get(job_id) else {
                return Ok((None, false));
            };
            let previous = current.status;
            let mut record = reconcile_background_job(current, probe.as_ref(), &now);
            let mut signal_sent = false;
            if record.status == BackgroundJobStatus::Running {
                match send_signal(SignalTarget::Group(record.pid), ProcessSignal::Terminate) {
                    Ok(()) => signal_sent = true,
                    Err(error) if error.is_no_such_process() => {}
                    Err(error) => tracing::warn!(
                        job_id = %record.id,
                        pid = record.pid,
                        error = %error,
                        "failed to signal background job"
                    ),
                }
                record.status = BackgroundJobStatus::Stopped;
                record.ended_at = Some(now.clone());
            }
            let changed = &record != current;
            if changed {
                state.jobs.insert(job_id.to_string(), record.clone());
            }
            Ok((
                Some((
                    BackgroundJobStopReport {
                        job: record,
                        signal_sent,
                    },
                    previous,
                    changed,
                )),
                changed,
            ))
        })?;
        Ok(outcome.map(|(report, previous, changed)| {
            if changed {
                self.log_transition(&report.job, previous);
            }
            report
        }))
    }

    /// Tail of a job's combined output log, `None` for an unknown id.
    pub fn read_job_log_tail(&self, job_id: &str, max_bytes: usize) -> Result<Option<String>> {
        let state = load_json_document::<BackgroundJobsState>(&self.store_path())?;
        let Some(record) = state.jobs.get(job_id) else {
            return Ok(None);
        };
        read_log_tail(&record.log_path, max_bytes).map(Some)
    }

    fn reconcile_store(&self) -> Result<(Vec<BackgroundJobRecord>, Vec<BackgroundJobTransition>)> {
        let store_path = self.store_path();
        if !store_path.exists() {
            return Ok((Vec::new(), Vec::new()));
        }
        let now = current_utc_rfc3339();
        let probe = Arc::clone(&self.probe);
        let (jobs, transitions) =
            update_json_document::<BackgroundJobsState, _, _>(&store_path, |state| {
                let mut transitions = Vec::new();
                for record in state.jobs.values_mut() {
                    let reconciled = reconcile_background_job(record, probe.as_ref(), &now);
                    if &reconciled != record {
                        transitions.push(BackgroundJobTransition {
                            id: reconciled.id.clone(),
                            from: record.status,
                            to: reconciled.status,
                        });
                        *record = reconciled;
                    }
                }
                let changed = !transitions.is_empty();
                let jobs = state.jobs.values().cloned().collect::<Vec<_>>();
                Ok(((jobs, transitions), changed))
            })?;
        for transition in &transitions {
            if let Some(record) = jobs.iter().find(|record| record.id == transition.id) {
                self.log_transition(record, transition.from);
            }
        }
        Ok((jobs, transitions))
    }

    fn log_transition(&self, record: &BackgroundJobRecord, previous: BackgroundJobStatus) {
        if record.status == previous {
            return;
        }
        tracing::debug!(
            job_id = %record.id,
            from = previous.as_str(),
            to = record.status.as_str(),
            exit_code = ?record.exit_code,
            "background job reconciled"
        );
        let detail = match record.exit_code {
            Some(code) => format!("{} -> {} (exit {code})", previous.as_str(), record.status.as_str()),
            None => format!("{} -> {}", previous.as_str(), record.status.as_str()),
        };
        self.append_event(record, record.status.as_str(), &detail);
    }

    fn append_event(&self, record: &BackgroundJobRecord, event: &str, detail: &str) {
        let event = BackgroundJobEventRecord {
            timestamp_unix_ms: current_unix_timestamp_ms(),
            job_id: record.id.clone(),
            event: event.to_string(),
            status: record.status.as_str().to_string(),
            detail: detail.to_string(),
        };
        let path = self.events_path();
        if let Err(error) = append_jsonl_record(&path, &event) {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "background job event append failed"
            );
        }
    }
}

fn allocate_background_job_id(state: &BackgroundJobsState) -> String {
    loop {
        let candidate = next_background_job_id();
        if !state.jobs.contains_key(&candidate) {
            return candidate;
        }
    }
}

fn next_background_job_id() -> String {
    let suffix = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(BACKGROUND_JOB_ID_SUFFIX_LEN)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect::<String>();
    format!(
        "{BACKGROUND_JOB_ID_PREFIX}-{}-{suffix}",
        current_unix_timestamp_ms()
    )
}

/// Builds the `sh` script that runs `command` and records its exit code.
pub fn build_background_job_wrapper_script(shell: &str, command: &str, status_path: &Path) -> String {
    let status = status_path.display().to_string();
    let status_tmp = format!("{status}.tmp");
    format!(
        "{shell} -c {command}\n\
         code=$?\n\
         ended_at=$(date -u +%Y-%m-%dT%H:%M:%SZ)\n\
         printf '{{\"exit_code\":%d,\"ended_at\":\"%s\"}}\\n' \"$code\" \"$ended_at\" > {status_tmp}.$$ && mv -f {status_tmp}.$$ {status}\n\
         exit \"$code\"\n",
        shell = shell_words::quote(shell),
        command = shell_words::quote(command),
        status_tmp = shell_words::quote(&status_tmp),
        status = shell_words::quote(&status),
    )
}

fn read_log_tail(path: &Path, max_bytes: usize) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    let mut file =
        std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let length = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    let max_bytes = u64::try_from(max_bytes.max(1)).unwrap_or(u64::MAX);
    let truncated = length > max_bytes;
    if truncated {
        file.seek(SeekFrom::Start(length - max_bytes))
            .with_context(|| format!("failed to seek {}", path.display()))?;
    }
    let mut window = Vec::new();
    file.read_to_end(&mut window)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let text = String::from_utf8_lossy(&window).to_string();
    if truncated {
        return Ok(format!("<output truncated>\n{text}"));
    }
    Ok(text)
}

fn append_jsonl_record<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize,
{
    let line = serde_json::to_string(value).context("failed to encode JSONL record")?;
    append_line_with_rotation(path, &line, LogRotationPolicy::from_env())
        .with_context(|| format!("failed to append {}", path.display()))?;
    Ok(())
}
