//! Lifecycle of the detached heartbeat daemon.
//!
//! The daemon is the `kestrel heartbeat run` process started in its own
//! session. `heartbeat/runtime.json` names its pid; the controller and the
//! daemon share nothing else.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use kestrel_core::{
    current_unix_timestamp, current_utc_rfc3339, load_json_document, persist_json_document,
    StoreLock,
};
use serde::{Deserialize, Serialize};

use crate::heartbeat_scheduler_runtime::{
    append_heartbeat_batch_report, run_heartbeat_batch, HeartbeatBatchReport,
    HeartbeatExecutorRegistry, HeartbeatPlanSource,
};
use crate::process_spawn_runtime::{
    is_process_alive, send_signal, spawn_process, ProcessOutput, ProcessSignal, ProcessSpawnSpec,
    SignalTarget,
};
use crate::workspace_layout::WorkspaceLayout;

pub const HEARTBEAT_DEFAULT_POLL_SECONDS: u64 = 60;
pub const HEARTBEAT_MIN_POLL_SECONDS: u64 = 15;
const HEARTBEAT_DEFAULT_DAEMON_PROGRAM: &str = "kestrel";

/// Applies the default and the floor to a requested poll interval.
pub fn clamp_poll_interval(requested_seconds: Option<u64>) -> Duration {
    let seconds = requested_seconds
        .unwrap_or(HEARTBEAT_DEFAULT_POLL_SECONDS)
        .max(HEARTBEAT_MIN_POLL_SECONDS);
    Duration::from_secs(seconds)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRuntimeRecord {
    pub pid: u32,
    #[serde(alias = "startedAt")]
    pub started_at: String,
    pub workspace: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatDaemonPhase {
    Stopped,
    Starting,
    Running,
}

impl HeartbeatDaemonPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatDaemonConfig {
    pub layout: WorkspaceLayout,
    pub poll_interval: Duration,
    pub program: String,
    pub args: Vec<String>,
}

impl HeartbeatDaemonConfig {
    /// Runs the current executable as `heartbeat run` for `layout`.
    pub fn for_layout(layout: WorkspaceLayout, poll_interval: Duration) -> Self {
        let program = std::env::current_exe()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|_| HEARTBEAT_DEFAULT_DAEMON_PROGRAM.to_string());
        let args = vec![
            "--workspace".to_string(),
            layout.workspace().display().to_string(),
            "--state-dir".to_string(),
            layout.state_dir().display().to_string(),
            "heartbeat".to_string(),
            "run".to_string(),
            "--poll-seconds".to_string(),
            poll_interval.as_secs().to_string(),
        ];
        Self {
            layout,
            poll_interval,
            program,
            args,
        }
    }

    /// Replaces the daemon command line.
    pub fn with_command<I, S>(mut self, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program = program.into();
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for HeartbeatDaemonConfig {
    fn default() -> Self {
        Self::for_layout(
            WorkspaceLayout::new(".", None),
            clamp_poll_interval(None),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatStartReport {
    pub started: bool,
    pub already_running: bool,
    pub pid: u32,
    pub phase: HeartbeatDaemonPhase,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatDaemonStatus {
    pub running: bool,
    /// A runtime record exists but its pid is gone.
    pub stale: bool,
    pub phase: HeartbeatDaemonPhase,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
    pub runtime_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatStopReport {
    pub was_running: bool,
    pub signal_sent: bool,
    pub pid: Option<u32>,
}

fn load_runtime_record(path: &Path) -> Result<Option<HeartbeatRuntimeRecord>> {
    load_json_document::<Option<HeartbeatRuntimeRecord>>(path)
        .with_context(|| format!("failed to load heartbeat runtime record {}", path.display()))
}

fn remove_runtime_record(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => {
            Err(error).with_context(|| format!("failed to remove {}", path.display()))
        }
    }
}

/// Spawns the daemon unless a live one is already recorded.
pub fn start_heartbeat_daemon(config: &HeartbeatDaemonConfig) -> Result<HeartbeatStartReport> {
    let layout = &config.layout;
    layout.ensure()?;
    let runtime_path = layout.heartbeat_runtime_path();
    let log_path = layout.heartbeat_daemon_log_path();
    let _lock = StoreLock::acquire(&runtime_path)?;

    if let Some(record) = load_runtime_record(&runtime_path)? {
        if is_process_alive(record.pid) {
            return Ok(HeartbeatStartReport {
                started: false,
                already_running: true,
                pid: record.pid,
                phase: HeartbeatDaemonPhase::Running,
                log_path,
            });
        }
        tracing::debug!(pid = record.pid, "replacing stale heartbeat runtime record");
    }

    let spec = ProcessSpawnSpec::new(config.program.clone())
        .with_args(config.args.clone())
        .with_cwd(layout.workspace())
        .with_output(ProcessOutput::AppendToLog(log_path.clone()))
        .detached();
    let process = spawn_process(&spec)
        .map_err(anyhow::Error::new)
        .context("failed to start heartbeat daemon")?;
    let pid = process.pid();
    persist_json_document(
        &runtime_path,
        &HeartbeatRuntimeRecord {
            pid,
            started_at: current_utc_rfc3339(),
            workspace: layout.workspace().to_path_buf(),
        },
    )?;
    process.spawn_reaper();
    tracing::info!(pid, log = %log_path.display(), "heartbeat daemon started");
    Ok(HeartbeatStartReport {
        started: true,
        already_running: false,
        pid,
        phase: HeartbeatDaemonPhase::Starting,
        log_path,
    })
}

/// Reports the recorded daemon; stale records are left in place.
pub fn heartbeat_daemon_status(layout: &WorkspaceLayout) -> Result<HeartbeatDaemonStatus> {
    let runtime_path = layout.heartbeat_runtime_path();
    let record = load_runtime_record(&runtime_path)?;
    let running = record
        .as_ref()
        .is_some_and(|record| is_process_alive(record.pid));
    Ok(HeartbeatDaemonStatus {
        running,
        stale: record.is_some() && !running,
        phase: if running {
            HeartbeatDaemonPhase::Running
        } else {
            HeartbeatDaemonPhase::Stopped
        },
        pid: record.as_ref().map(|record| record.pid),
        started_at: record.map(|record| record.started_at),
        runtime_path,
    })
}

/// Sends `SIGTERM` to the recorded daemon and deletes the record.
pub fn stop_heartbeat_daemon(layout: &WorkspaceLayout) -> Result<HeartbeatStopReport> {
    let runtime_path = layout.heartbeat_runtime_path();
    let _lock = StoreLock::acquire(&runtime_path)?;
    let Some(record) = load_runtime_record(&runtime_path)? else {
        return Ok(HeartbeatStopReport {
            was_running: false,
            signal_sent: false,
            pid: None,
        });
    };
    let was_running = is_process_alive(record.pid);
    let signal_sent = match send_signal(SignalTarget::Process(record.pid), ProcessSignal::Terminate)
    {
        Ok(()) => true,
        Err(error) if error.is_no_such_process() => false,
        Err(error) => {
            tracing::warn!(pid = record.pid, error = %error, "failed to signal heartbeat daemon");
            false
        }
    };
    remove_runtime_record(&runtime_path)?;
    tracing::info!(pid = record.pid, signal_sent, "heartbeat daemon stopped");
    Ok(HeartbeatStopReport {
        was_running,
        signal_sent,
        pid: Some(record.pid),
    })
}

/// Removes the runtime record on drop, but only while it still names `pid`.
#[derive(Debug)]
pub struct HeartbeatRuntimeRecordGuard {
    path: PathBuf,
    pid: u32,
}

impl HeartbeatRuntimeRecordGuard {
    pub async fn install(layout: &WorkspaceLayout, pid: u32) -> Result<Self> {
        let path = layout.heartbeat_runtime_path();
        let _lock = StoreLock::acquire_async(&path).await?;
        persist_json_document(
            &path,
            &HeartbeatRuntimeRecord {
                pid,
                started_at: current_utc_rfc3339(),
                workspace: layout.workspace().to_path_buf(),
            },
        )?;
        Ok(Self { path, pid })
    }
}

impl Drop for HeartbeatRuntimeRecordGuard {
    fn drop(&mut self) {
        let owned = match load_runtime_record(&self.path) {
            Ok(Some(record)) => record.pid == self.pid,
            Ok(None) => false,
            Err(error) => {
                tracing::warn!(error = %format!("{error:#}"), "failed to read heartbeat runtime record");
                false
            }
        };
        if owned {
            if let Err(error) = remove_runtime_record(&self.path) {
                tracing::warn!(error = %format!("{error:#}"), "failed to remove heartbeat runtime record");
            }
        }
    }
}

/// Loads the plan, runs one batch and appends it to the heartbeat event log.
pub async fn run_heartbeat_once(
    layout: &WorkspaceLayout,
    plan: &dyn HeartbeatPlanSource,
    registry: &HeartbeatExecutorRegistry,
) -> Result<HeartbeatBatchReport> {
    let tasks = plan.load_plan()?;
    let report = run_heartbeat_batch(
        &tasks,
        &layout.heartbeat_state_path(),
        registry,
        current_unix_timestamp(),
    )
    .await?;
    let events_path = layout.heartbeat_events_path();
    if let Err(error) = append_heartbeat_batch_report(&events_path, &report) {
        tracing::warn!(
            path = %events_path.display(),
            error = %format!("{error:#}"),
            "heartbeat event append failed"
        );
    }
    Ok(report)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatLoopSummary {
    pub batches: u64,
    pub failed_batches: u64,
}

/// Runs batches every `poll_interval` until `shutdown` resolves.
pub async fn run_heartbeat_daemon_loop<S>(
    layout: &WorkspaceLayout,
    poll_interval: Duration,
    plan: &dyn HeartbeatPlanSource,
    registry: &HeartbeatExecutorRegistry,
    shutdown: S,
) -> Result<HeartbeatLoopSummary>
where
    S: Future<Output = ()>,
{
    layout.ensure()?;
    let pid = std::process::id();
    let _guard = HeartbeatRuntimeRecordGuard::install(layout, pid).await?;
    tracing::info!(
        pid,
        phase = HeartbeatDaemonPhase::Running.as_str(),
        poll_seconds = poll_interval.as_secs_f64(),
        "heartbeat daemon loop running"
    );

    let mut summary = HeartbeatLoopSummary::default();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            outcome = run_heartbeat_once(layout, plan, registry) => {
                summary.batches = summary.batches.saturating_add(1);
                if let Err(error) = outcome {
                    summary.failed_batches = summary.failed_batches.saturating_add(1);
                    tracing::warn!(error = %format!("{error:#}"), "heartbeat batch failed");
                }
            }
        }
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    tracing::info!(
        pid,
        phase = HeartbeatDaemonPhase::Stopped.as_str(),
        batches = summary.batches,
        "heartbeat daemon loop stopped"
    );
    Ok(summary)
}

/// Resolves on `SIGINT` or `SIGTERM`.
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to install SIGTERM handler");
            }
        }
    }
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to wait for ctrl-c");
        std::future::pending::<()>().await;
    }
}
