use std::sync::Arc;

use async_trait::async_trait;
use kestrel_runtime::{
    ApprovalGate, BackgroundJobRecord, BackgroundJobRequest, BackgroundJobRuntime,
    BackgroundJobRuntimeConfig, BackgroundLaunchOutcome, CommandRunOutcome,
    ForegroundCommandConfig, ForegroundCommandRequest, ForegroundCommandRunner, WorkspaceLayout,
    BACKGROUND_JOB_DEFAULT_LOG_TAIL_BYTES,
};
use serde_json::{json, Value};

use crate::tool_arguments::{
    optional_path, optional_string, optional_u64, optional_usize, required_string,
};
use crate::{AgentTool, ToolDefinition, ToolExecutionResult};

pub const COMMAND_RUNNER_TOOL_NAME: &str = "command_runner";
const MAX_LOG_TAIL_BYTES: usize = 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRunnerAction {
    Run,
    StartBackground,
    ListBackground,
    StatusBackground,
    StopBackground,
}

impl CommandRunnerAction {
    pub const ALL: [Self; 5] = [
        Self::Run,
        Self::StartBackground,
        Self::ListBackground,
        Self::StatusBackground,
        Self::StopBackground,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::StartBackground => "start_background",
            Self::ListBackground => "list_background",
            Self::StatusBackground => "status_background",
            Self::StopBackground => "stop_background",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == normalized)
    }
}

/// Runs commands in the foreground or as detached background jobs.
#[derive(Clone)]
pub struct CommandRunnerTool {
    runner: ForegroundCommandRunner,
    jobs: BackgroundJobRuntime,
}

impl CommandRunnerTool {
    pub fn new(runner: ForegroundCommandRunner, jobs: BackgroundJobRuntime) -> Self {
        Self { runner, jobs }
    }

    /// Wires both runners for `layout`, sharing one approval gate.
    pub fn for_layout(
        layout: &WorkspaceLayout,
        gate: Arc<dyn ApprovalGate>,
        shell: &str,
    ) -> anyhow::Result<Self> {
        let runner = ForegroundCommandRunner::new(
            ForegroundCommandConfig {
                shell: shell.to_string(),
                ..ForegroundCommandConfig::for_workspace(layout.workspace())
            },
            Arc::clone(&gate),
        );
        let jobs = BackgroundJobRuntime::new(
            BackgroundJobRuntimeConfig {
                state_dir: layout.jobs_dir(),
                shell: shell.to_string(),
                default_cwd: layout.workspace().to_path_buf(),
            },
            gate,
        )?;
        Ok(Self::new(runner, jobs))
    }

    async fn run_foreground(&self, arguments: &Value) -> Result<ToolExecutionResult, String> {
        let request = ForegroundCommandRequest {
            command: required_string(arguments, "command")?,
            cwd: optional_path(arguments, "cwd")?,
            timeout_ms: optional_u64(arguments, "timeout_ms")?,
            max_output_chars: optional_usize(arguments, "max_output_chars")?,
        };
        match self.runner.run(&request).await {
            CommandRunOutcome::Denied { reason } => Ok(denied_result(
                CommandRunnerAction::Run,
                &request.command,
                &reason,
            )),
            CommandRunOutcome::Completed(result) => Ok(ToolExecutionResult::ok(json!({
                "action": CommandRunnerAction::Run.as_str(),
                "command": request.command,
                "success": result.success(),
                "exit_code": result.exit_code,
                "timed_out": result.timed_out,
                "truncated": result.truncated,
                "duration_ms": result.duration_ms,
                "stdout": result.stdout,
                "stderr": result.stderr,
            }))),
        }
    }

    async fn start_background(&self, arguments: &Value) -> Result<ToolExecutionResult, String> {
        let request = BackgroundJobRequest {
            command: required_string(arguments, "command")?,
            cwd: optional_path(arguments, "cwd")?,
        };
        match self.jobs.start_job(&request).await {
            Ok(BackgroundLaunchOutcome::Started(job)) => Ok(ToolExecutionResult::ok(json!({
                "action": CommandRunnerAction::StartBackground.as_str(),
                "job": job_payload(&job),
            }))),
            Ok(BackgroundLaunchOutcome::Denied { reason }) => Ok(denied_result(
                CommandRunnerAction::StartBackground,
                &request.command,
                &reason,
            )),
            Err(error) => Err(format!("{error:#}")),
        }
    }

    fn list_background(&self) -> Result<ToolExecutionResult, String> {
        let jobs = self.jobs.list_jobs().map_err(|error| format!("{error:#}"))?;
        Ok(ToolExecutionResult::ok(json!({
            "action": CommandRunnerAction::ListBackground.as_str(),
            "count": jobs.len(),
            "jobs": jobs.iter().map(job_payload).collect::<Vec<_>>(),
        })))
    }

    fn status_background(&self, arguments: &Value) -> Result<ToolExecutionResult, String> {
        let job_id = required_string(arguments, "job_id")?;
        let tail_bytes = optional_usize(arguments, "log_tail_bytes")?
            .unwrap_or(BACKGROUND_JOB_DEFAULT_LOG_TAIL_BYTES)
            .min(MAX_LOG_TAIL_BYTES);
        let Some(job) = self
            .jobs
            .job_status(&job_id)
            .map_err(|error| format!("{error:#}"))?
        else {
            return Ok(unknown_job_result(CommandRunnerAction::StatusBackground, &job_id));
        };
        let log_tail = self
            .jobs
            .read_job_log_tail(&job_id, tail_bytes)
            .map_err(|error| format!("{error:#}"))?
            .unwrap_or_default();
        Ok(ToolExecutionResult::ok(json!({
            "action": CommandRunnerAction::StatusBackground.as_str(),
            "job": job_payload(&job),
            "log_tail": log_tail,
        })))
    }

    fn stop_background(&self, arguments: &Value) -> Result<ToolExecutionResult, String> {
        let job_id = required_string(arguments, "job_id")?;
        let Some(report) = self
            .jobs
            .stop_job(&job_id)
            .map_err(|error| format!("{error:#}"))?
        else {
            return Ok(unknown_job_result(CommandRunnerAction::StopBackground, &job_id));
        };
        Ok(ToolExecutionResult::ok(json!({
            "action": CommandRunnerAction::StopBackground.as_str(),
            "signal_sent": report.signal_sent,
            "job": job_payload(&report.job),
        })))
    }
}

fn job_payload(job: &BackgroundJobRecord) -> Value {
    let mut payload = serde_json::to_value(job).unwrap_or_else(|_| json!({ "id": job.id }));
    if let Value::Object(map) = &mut payload {
        map.insert(
            "failure_shaped".to_string(),
            json!(job.status.is_failure_shaped()),
        );
    }
    payload
}

fn denied_result(action: CommandRunnerAction, command: &str, reason: &str) -> ToolExecutionResult {
    ToolExecutionResult::error(json!({
        "action": action.as_str(),
        "command": command,
        "denied": true,
        "error": format!("approval denied: {reason}"),
    }))
}

fn unknown_job_result(action: CommandRunnerAction, job_id: &str) -> ToolExecutionResult {
    ToolExecutionResult::error(json!({
        "action": action.as_str(),
        "job_id": job_id,
        "error": format!("unknown background job '{job_id}'"),
    }))
}

#[async_trait]
impl AgentTool for CommandRunnerTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: COMMAND_RUNNER_TOOL_NAME.to_string(),
            description: "Run a shell command in the foreground, or start, list, inspect and stop detached background jobs".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": CommandRunnerAction::ALL.iter().map(|action| action.as_str()).collect::<Vec<_>>(),
                    },
                    "command": { "type": "string" },
                    "cwd": { "type": "string" },
                    "timeout_ms": { "type": "integer", "minimum": 0 },
                    "max_output_chars": { "type": "integer", "minimum": 0 },
                    "job_id": { "type": "string" },
                    "log_tail_bytes": { "type": "integer", "minimum": 1 }
                },
                "required": ["action"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let raw_action = match optional_string(&arguments, "action") {
            Ok(Some(action)) => action,
            Ok(None) => {
                return ToolExecutionResult::error(json!({
                    "error": "missing required string argument 'action'"
                }))
            }
            Err(error) => return ToolExecutionResult::error(json!({ "error": error })),
        };
        let Some(action) = CommandRunnerAction::parse(&raw_action) else {
            return ToolExecutionResult::error(json!({
                "error": format!(
                    "unsupported action '{raw_action}'; expected one of: {}",
                    CommandRunnerAction::ALL
                        .iter()
                        .map(|action| action.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            }));
        };
        tracing::debug!(action = action.as_str(), "command_runner invoked");

        let result = match action {
            CommandRunnerAction::Run => self.run_foreground(&arguments).await,
            CommandRunnerAction::StartBackground => self.start_background(&arguments).await,
            CommandRunnerAction::ListBackground => self.list_background(),
            CommandRunnerAction::StatusBackground => self.status_background(&arguments),
            CommandRunnerAction::StopBackground => self.stop_background(&arguments),
        };
        result.unwrap_or_else(|error| {
            ToolExecutionResult::error(json!({
                "action": action.as_str(),
                "error": error,
            }))
        })
    }
}
