//! Interval-based heartbeat tasks with persisted last-check times.
//!
//! A batch loads state fresh from disk, runs every due task in plan order and
//! persists the new check times in one locked write. Nothing is written when
//! no task is due.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kestrel_core::{
    append_line_with_rotation, current_unix_timestamp_ms, load_json_document,
    update_json_document_async, LogRotationPolicy,
};
use serde::{Deserialize, Serialize};

pub const BACKGROUND_JOBS_RECONCILE_TASK_KEY: &str = "background_jobs_reconcile";
pub const RUNTIME_TEMP_CLEANUP_TASK_KEY: &str = "runtime_temp_cleanup";
const BACKGROUND_JOBS_RECONCILE_INTERVAL_SECONDS: u64 = 300;
const RUNTIME_TEMP_CLEANUP_INTERVAL_SECONDS: u64 = 3_600;
const PLACEHOLDER_EXECUTOR_SUMMARY: &str = "no executor registered; skipped";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatTask {
    pub key: String,
    pub title: String,
    #[serde(alias = "intervalSeconds")]
    pub interval_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Shell command run by the command executor when no built-in matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl HeartbeatTask {
    pub fn new(key: impl Into<String>, title: impl Into<String>, interval_seconds: u64) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            interval_seconds,
            description: None,
            command: None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatState {
    /// Unix seconds of the last attempt, per task key.
    #[serde(default, alias = "lastChecks")]
    pub last_checks: BTreeMap<String, u64>,
    #[serde(default, alias = "lastResults")]
    pub last_results: BTreeMap<String, String>,
}

pub fn is_task_due(task: &HeartbeatTask, state: &HeartbeatState, now: u64) -> bool {
    let last = state.last_checks.get(&task.key).copied().unwrap_or(0);
    now.saturating_sub(last) >= task.interval_seconds
}

pub fn due_heartbeat_tasks<'a>(
    tasks: &'a [HeartbeatTask],
    state: &HeartbeatState,
    now: u64,
) -> Vec<&'a HeartbeatTask> {
    tasks
        .iter()
        .filter(|task| is_task_due(task, state, now))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatTaskOutcome {
    pub ok: bool,
    pub summary: String,
    /// Something an operator should look at, independent of `ok`.
    pub urgent: bool,
}

impl HeartbeatTaskOutcome {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            ok: true,
            summary: summary.into(),
            urgent: false,
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            ok: false,
            summary: summary.into(),
            urgent: false,
        }
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }
}

#[async_trait]
pub trait HeartbeatTaskExecutor: Send + Sync {
    async fn execute(&self, task: &HeartbeatTask) -> Result<HeartbeatTaskOutcome>;
}

/// Resolves a task to a built-in executor, the command executor, or nothing.
#[derive(Clone, Default)]
pub struct HeartbeatExecutorRegistry {
    builtins: BTreeMap<String, Arc<dyn HeartbeatTaskExecutor>>,
    command_executor: Option<Arc<dyn HeartbeatTaskExecutor>>,
}

impl HeartbeatExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin(
        mut self,
        key: impl Into<String>,
        executor: Arc<dyn HeartbeatTaskExecutor>,
    ) -> Self {
        self.builtins.insert(key.into(), executor);
        self
    }

    pub fn with_command_executor(mut self, executor: Arc<dyn HeartbeatTaskExecutor>) -> Self {
        self.command_executor = Some(executor);
        self
    }

    pub fn builtin_keys(&self) -> Vec<&str> {
        self.builtins.keys().map(String::as_str).collect()
    }

    pub fn resolve(&self, task: &HeartbeatTask) -> Option<Arc<dyn HeartbeatTaskExecutor>> {
        if let Some(executor) = self.builtins.get(&task.key) {
            return Some(Arc::clone(executor));
        }
        if task.command.is_some() {
            return self.command_executor.as_ref().map(Arc::clone);
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatTaskRun {
    pub key: String,
    pub title: String,
    pub ok: bool,
    pub summary: String,
    pub urgent: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatBatchReport {
    pub checked_at: u64,
    pub tasks_total: usize,
    pub runs: Vec<HeartbeatTaskRun>,
}

impl HeartbeatBatchReport {
    /// True when every attempted task succeeded, including an empty batch.
    pub fn all_ok(&self) -> bool {
        self.runs.iter().all(|run| run.ok)
    }

    pub fn has_urgent(&self) -> bool {
        self.runs.iter().any(|run| run.urgent)
    }

    pub fn is_noop(&self) -> bool {
        self.runs.is_empty()
    }
}

fn format_last_result(run: &HeartbeatTaskRun) -> String {
    let status = if run.ok { "ok" } else { "failed" };
    format!("{status}: {}", run.summary)
}

/// Runs every due task sequentially and records the attempts.
pub async fn run_heartbeat_batch(
    tasks: &[HeartbeatTask],
    state_path: &Path,
    registry: &HeartbeatExecutorRegistry,
    now: u64,
) -> Result<HeartbeatBatchReport> {
    let state = load_json_document::<HeartbeatState>(state_path)?;
    let due = due_heartbeat_tasks(tasks, &state, now);
    let mut report = HeartbeatBatchReport {
        checked_at: now,
        tasks_total: tasks.len(),
        runs: Vec::with_capacity(due.len()),
    };
    if due.is_empty() {
        tracing::debug!(tasks = tasks.len(), "no heartbeat task due");
        return Ok(report);
    }

    for task in due {
        let started = Instant::now();
        let outcome = match registry.resolve(task) {
            Some(executor) => executor.execute(task).await,
            None => Ok(HeartbeatTaskOutcome::ok(PLACEHOLDER_EXECUTOR_SUMMARY)),
        };
        let outcome = outcome.unwrap_or_else(|error| {
            let detail = format!("{error:#}");
            tracing::warn!(task = %task.key, error = %detail, "heartbeat task failed");
            HeartbeatTaskOutcome::failed(detail)
        });
        report.runs.push(HeartbeatTaskRun {
            key: task.key.clone(),
            title: task.title.clone(),
            ok: outcome.ok,
            summary: outcome.summary,
            urgent: outcome.urgent,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });
    }

    update_json_document_async::<HeartbeatState, _, _>(state_path, |state| {
        for run in &report.runs {
            state.last_checks.insert(run.key.clone(), now);
            state
                .last_results
                .insert(run.key.clone(), format_last_result(run));
        }
        Ok(((), true))
    })
    .await
    .with_context(|| format!("failed to persist heartbeat state {}", state_path.display()))?;

    tracing::info!(
        ran = report.runs.len(),
        all_ok = report.all_ok(),
        urgent = report.has_urgent(),
        "heartbeat batch finished"
    );
    Ok(report)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPlan {
    #[serde(default)]
    pub tasks: Vec<HeartbeatTask>,
}

/// Rejects empty keys, zero intervals and duplicate keys.
pub fn validate_heartbeat_plan(tasks: &[HeartbeatTask]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for task in tasks {
        let key = task.key.trim();
        if key.is_empty() {
            anyhow::bail!("heartbeat task key cannot be empty");
        }
        if task.interval_seconds == 0 {
            anyhow::bail!("heartbeat task '{key}' must have an interval greater than zero");
        }
        if !seen.insert(key) {
            anyhow::bail!("heartbeat task '{key}' is defined more than once");
        }
    }
    Ok(())
}

pub fn default_heartbeat_plan() -> Vec<HeartbeatTask> {
    vec![
        HeartbeatTask::new(
            BACKGROUND_JOBS_RECONCILE_TASK_KEY,
            "Reconcile background jobs",
            BACKGROUND_JOBS_RECONCILE_INTERVAL_SECONDS,
        )
        .with_description("recompute job status from process liveness and status files"),
        HeartbeatTask::new(
            RUNTIME_TEMP_CLEANUP_TASK_KEY,
            "Clean runtime temp files",
            RUNTIME_TEMP_CLEANUP_INTERVAL_SECONDS,
        )
        .with_description("remove stale files under tmp/ and voice/"),
    ]
}

pub trait HeartbeatPlanSource: Send + Sync {
    fn load_plan(&self) -> Result<Vec<HeartbeatTask>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticHeartbeatPlanSource {
    tasks: Vec<HeartbeatTask>,
}

impl StaticHeartbeatPlanSource {
    pub fn new(tasks: Vec<HeartbeatTask>) -> Self {
        Self { tasks }
    }
}

impl HeartbeatPlanSource for StaticHeartbeatPlanSource {
    fn load_plan(&self) -> Result<Vec<HeartbeatTask>> {
        validate_heartbeat_plan(&self.tasks)?;
        Ok(self.tasks.clone())
    }
}

/// Reads `{ "tasks": [...] }`, using the default plan when the file is missing.
#[derive(Debug, Clone)]
pub struct JsonHeartbeatPlanSource {
    path: PathBuf,
}

impl JsonHeartbeatPlanSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl HeartbeatPlanSource for JsonHeartbeatPlanSource {
    fn load_plan(&self) -> Result<Vec<HeartbeatTask>> {
        if !self.path.exists() {
            return Ok(default_heartbeat_plan());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let plan = serde_json::from_str::<HeartbeatPlan>(&raw)
            .with_context(|| format!("failed to parse heartbeat plan {}", self.path.display()))?;
        validate_heartbeat_plan(&plan.tasks)
            .with_context(|| format!("invalid heartbeat plan {}", self.path.display()))?;
        Ok(plan.tasks)
    }
}

#[derive(Debug, Serialize)]
struct HeartbeatBatchEvent<'a> {
    timestamp_unix_ms: u64,
    #[serde(flatten)]
    report: &'a HeartbeatBatchReport,
    all_ok: bool,
}

/// Appends one JSON line per non-empty batch.
pub fn append_heartbeat_batch_report(events_path: &Path, report: &HeartbeatBatchReport) -> Result<()> {
    if report.is_noop() {
        return Ok(());
    }
    let event = HeartbeatBatchEvent {
        timestamp_unix_ms: current_unix_timestamp_ms(),
        report,
        all_ok: report.all_ok(),
    };
    let line = serde_json::to_string(&event).context("failed to serialize heartbeat batch")?;
    append_line_with_rotation(events_path, &line, LogRotationPolicy::from_env())
        .with_context(|| format!("failed to append {}", events_path.display()))
}
