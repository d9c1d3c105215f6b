//! Built-in heartbeat task executors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::approval_gate::ApprovalGate;
use crate::background_jobs_runtime::{BackgroundJobRuntime, BackgroundJobRuntimeConfig};
use crate::foreground_command_runtime::{
    CommandRunOutcome, ForegroundCommandConfig, ForegroundCommandRequest, ForegroundCommandRunner,
};
use crate::heartbeat_scheduler_runtime::{
    HeartbeatExecutorRegistry, HeartbeatTask, HeartbeatTaskExecutor, HeartbeatTaskOutcome,
    BACKGROUND_JOBS_RECONCILE_TASK_KEY, RUNTIME_TEMP_CLEANUP_TASK_KEY,
};
use crate::workspace_layout::WorkspaceLayout;

pub const DEFAULT_RUNTIME_TEMP_MAX_AGE_SECONDS: u64 = 3_600;
const COMMAND_SUMMARY_MAX_CHARS: usize = 200;

/// Reconciles the job store; urgent when a job ends failed or unknown.
#[derive(Clone)]
pub struct BackgroundJobsReconcileExecutor {
    jobs: BackgroundJobRuntime,
}

impl BackgroundJobsReconcileExecutor {
    pub fn new(jobs: BackgroundJobRuntime) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl HeartbeatTaskExecutor for BackgroundJobsReconcileExecutor {
    async fn execute(&self, _task: &HeartbeatTask) -> Result<HeartbeatTaskOutcome> {
        let transitions = self.jobs.reconcile_all()?;
        let failures = transitions
            .iter()
            .filter(|transition| transition.to.is_failure_shaped())
            .map(|transition| format!("{}={}", transition.id, transition.to.as_str()))
            .collect::<Vec<_>>();
        let summary = if transitions.is_empty() {
            "no job changed status".to_string()
        } else if failures.is_empty() {
            format!("{} job(s) finished", transitions.len())
        } else {
            format!(
                "{} job(s) finished; needs attention: {}",
                transitions.len(),
                failures.join(", ")
            )
        };
        let outcome = HeartbeatTaskOutcome::ok(summary);
        if failures.is_empty() {
            Ok(outcome)
        } else {
            Ok(outcome.urgent())
        }
    }
}

/// Removes regular files older than `max_age` below each directory.
#[derive(Debug, Clone)]
pub struct RuntimeTempCleanupExecutor {
    dirs: Vec<PathBuf>,
    max_age: Duration,
}

impl RuntimeTempCleanupExecutor {
    pub fn new(dirs: Vec<PathBuf>, max_age: Duration) -> Self {
        Self { dirs, max_age }
    }
}

#[async_trait]
impl HeartbeatTaskExecutor for RuntimeTempCleanupExecutor {
    async fn execute(&self, _task: &HeartbeatTask) -> Result<HeartbeatTaskOutcome> {
        let mut removed = 0_usize;
        for dir in &self.dirs {
            removed = removed.saturating_add(cleanup_stale_files_in_dir(dir, self.max_age)?);
        }
        Ok(HeartbeatTaskOutcome::ok(format!(
            "removed {removed} stale file(s)"
        )))
    }
}

pub fn cleanup_stale_files_in_dir(path: &Path, max_age: Duration) -> Result<usize> {
    if !path.is_dir() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0_usize;
    let mut stack = vec![path.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("failed to read {}", current.display()))?;
        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to read entry in {}", current.display()))?;
            let entry_path = entry.path();
            let file_type = entry.file_type().with_context(|| {
                format!("failed to read file type for {}", entry_path.display())
            })?;
            if file_type.is_dir() {
                stack.push(entry_path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .with_context(|| format!("failed to read metadata for {}", entry_path.display()))?
                .modified()
                .unwrap_or(now);
            if now.duration_since(modified).unwrap_or_default() >= max_age {
                std::fs::remove_file(&entry_path)
                    .with_context(|| format!("failed to remove {}", entry_path.display()))?;
                removed = removed.saturating_add(1);
            }
        }
    }
    Ok(removed)
}

/// Runs a task's `command` through the foreground runner; ok iff it exits 0.
#[derive(Clone)]
pub struct ShellCommandExecutor {
    runner: ForegroundCommandRunner,
    timeout_ms: Option<u64>,
}

impl ShellCommandExecutor {
    pub fn new(runner: ForegroundCommandRunner) -> Self {
        Self {
            runner,
            timeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[async_trait]
impl HeartbeatTaskExecutor for ShellCommandExecutor {
    async fn execute(&self, task: &HeartbeatTask) -> Result<HeartbeatTaskOutcome> {
        let Some(command) = task.command.as_deref() else {
            anyhow::bail!("heartbeat task '{}' has no command", task.key);
        };
        let request = ForegroundCommandRequest {
            timeout_ms: self.timeout_ms,
            ..ForegroundCommandRequest::new(command)
        };
        match self.runner.run(&request).await {
            CommandRunOutcome::Denied { reason } => {
                Ok(HeartbeatTaskOutcome::failed(format!("denied: {reason}")))
            }
            CommandRunOutcome::Completed(result) if result.timed_out => Ok(
                HeartbeatTaskOutcome::failed(format!("timed out (exit code {})", result.exit_code)),
            ),
            CommandRunOutcome::Completed(result) => {
                let detail = last_line(if result.success() {
                    &result.stdout
                } else {
                    &result.stderr
                });
                let mut summary = format!("exit code {}", result.exit_code);
                if !detail.is_empty() {
                    summary.push_str(": ");
                    summary.push_str(&detail);
                }
                if result.success() {
                    Ok(HeartbeatTaskOutcome::ok(summary))
                } else {
                    Ok(HeartbeatTaskOutcome::failed(summary))
                }
            }
        }
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .chars()
        .take(COMMAND_SUMMARY_MAX_CHARS)
        .collect()
}

/// Registry with the job reconciler, temp cleanup and the command executor.
pub fn default_heartbeat_registry(
    layout: &WorkspaceLayout,
    gate: Arc<dyn ApprovalGate>,
    shell: &str,
) -> Result<HeartbeatExecutorRegistry> {
    let jobs = BackgroundJobRuntime::new(
        BackgroundJobRuntimeConfig {
            state_dir: layout.jobs_dir(),
            shell: shell.to_string(),
            default_cwd: layout.workspace().to_path_buf(),
        },
        Arc::clone(&gate),
    )?;
    let runner = ForegroundCommandRunner::new(
        ForegroundCommandConfig {
            shell: shell.to_string(),
            ..ForegroundCommandConfig::for_workspace(layout.workspace())
        },
        gate,
    );
    Ok(HeartbeatExecutorRegistry::new()
        .with_builtin(
            BACKGROUND_JOBS_RECONCILE_TASK_KEY,
            Arc::new(BackgroundJobsReconcileExecutor::new(jobs)),
        )
        .with_builtin(
            RUNTIME_TEMP_CLEANUP_TASK_KEY,
            Arc::new(RuntimeTempCleanupExecutor::new(
                vec![layout.tmp_dir(), layout.voice_dir()],
                Duration::from_secs(DEFAULT_RUNTIME_TEMP_MAX_AGE_SECONDS),
            )),
        )
        .with_command_executor(Arc::new(ShellCommandExecutor::new(runner))))
}
