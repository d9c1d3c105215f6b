//! Runs one shell command to completion with bounded output and a timeout.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::approval_gate::{ApprovalDecision, ApprovalGate, ApprovalRequest};
use crate::output_capture_runtime::{collect_capture, spawn_capture_reader, StreamCapture};
use crate::process_spawn_runtime::{
    send_signal, shell_command_spec, shell_program, spawn_process, ProcessOutput, SignalTarget,
};
use crate::termination_escalation::{escalate_until_exit, EscalationPlan};
use crate::workspace_layout::resolve_against;

pub const FOREGROUND_DEFAULT_TIMEOUT_MS: u64 = 120_000;
pub const FOREGROUND_MIN_TIMEOUT_MS: u64 = 1_000;
pub const FOREGROUND_MAX_TIMEOUT_MS: u64 = 86_400_000;
pub const FOREGROUND_DEFAULT_MAX_OUTPUT_CHARS: usize = 200_000;
pub const FOREGROUND_MIN_OUTPUT_CHARS: usize = 2_000;
pub const FOREGROUND_MAX_OUTPUT_CHARS: usize = 1_000_000;
pub const FOREGROUND_TIMEOUT_EXIT_CODE: i32 = 124;
pub const FOREGROUND_SPAWN_FAILURE_EXIT_CODE: i32 = 1;
const FOREGROUND_DRAIN_WINDOW_MS: u64 = 500;

pub fn clamp_timeout_ms(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(FOREGROUND_DEFAULT_TIMEOUT_MS)
        .clamp(FOREGROUND_MIN_TIMEOUT_MS, FOREGROUND_MAX_TIMEOUT_MS)
}

pub fn clamp_max_output_chars(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(FOREGROUND_DEFAULT_MAX_OUTPUT_CHARS)
        .clamp(FOREGROUND_MIN_OUTPUT_CHARS, FOREGROUND_MAX_OUTPUT_CHARS)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundCommandConfig {
    pub shell: String,
    /// Used when a request has no cwd; relative request cwds are joined onto it.
    pub default_cwd: PathBuf,
    pub drain_window: Duration,
}

impl ForegroundCommandConfig {
    pub fn for_workspace(workspace: &Path) -> Self {
        Self {
            default_cwd: workspace.to_path_buf(),
            ..Self::default()
        }
    }
}

impl Default for ForegroundCommandConfig {
    fn default() -> Self {
        Self {
            shell: shell_program(),
            default_cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            drain_window: Duration::from_millis(FOREGROUND_DRAIN_WINDOW_MS),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForegroundCommandRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    #[serde(default, alias = "maxOutputChars")]
    pub max_output_chars: Option<usize>,
}

impl ForegroundCommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForegroundCommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub truncated: bool,
    pub duration_ms: u64,
}

impl ForegroundCommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRunOutcome {
    Completed(ForegroundCommandResult),
    Denied { reason: String },
}

/// Approval-gated foreground runner.
#[derive(Clone)]
pub struct ForegroundCommandRunner {
    config: ForegroundCommandConfig,
    gate: Arc<dyn ApprovalGate>,
}

impl ForegroundCommandRunner {
    pub fn new(config: ForegroundCommandConfig, gate: Arc<dyn ApprovalGate>) -> Self {
        Self { config, gate }
    }

    pub fn config(&self) -> &ForegroundCommandConfig {
        &self.config
    }

    /// Consults the gate, then runs the command. A denial spawns nothing.
    pub async fn run(&self, request: &ForegroundCommandRequest) -> CommandRunOutcome {
        let cwd = request.cwd.as_deref().map_or_else(
            || self.config.default_cwd.clone(),
            |dir| resolve_against(&self.config.default_cwd, dir),
        );
        let approval = ApprovalRequest::run_command(&request.command, cwd.clone());
        if let ApprovalDecision::Denied { reason } = self.gate.review(&approval).await {
            tracing::info!(
                command = %request.command,
                reason = %reason,
                "foreground command denied"
            );
            return CommandRunOutcome::Denied { reason };
        }
        CommandRunOutcome::Completed(
            self.execute(
                &request.command,
                &cwd,
                clamp_timeout_ms(request.timeout_ms),
                clamp_max_output_chars(request.max_output_chars),
            )
            .await,
        )
    }

    async fn execute(
        &self,
        command: &str,
        cwd: &Path,
        timeout_ms: u64,
        max_output_chars: usize,
    ) -> ForegroundCommandResult {
        let started = Instant::now();
        let spec = shell_command_spec(&self.config.shell, command)
            .with_cwd(cwd)
            .with_output(ProcessOutput::Piped);
        let mut process = match spawn_process(&spec) {
            Ok(process) => process,
            Err(error) => {
                tracing::warn!(command = %command, error = %error, "foreground spawn failed");
                return ForegroundCommandResult {
                    stdout: String::new(),
                    stderr: error.to_string(),
                    exit_code: FOREGROUND_SPAWN_FAILURE_EXIT_CODE,
                    timed_out: false,
                    truncated: false,
                    duration_ms: elapsed_ms(started),
                };
            }
        };

        let stdout_capture = Arc::new(Mutex::new(StreamCapture::new(max_output_chars)));
        let stderr_capture = Arc::new(Mutex::new(StreamCapture::new(max_output_chars)));
        let stdout_reader = process
            .take_stdout()
            .map(|stream| spawn_capture_reader(stream, Arc::clone(&stdout_capture)));
        let stderr_reader = process
            .take_stderr()
            .map(|stream| spawn_capture_reader(stream, Arc::clone(&stderr_capture)));

        let pid = process.pid();
        let (exit, timed_out) =
            match tokio::time::timeout(Duration::from_millis(timeout_ms), process.wait()).await {
                Ok(exit) => (exit.map(Some), false),
                Err(_) => {
                    tracing::info!(pid, timeout_ms, "foreground command timed out");
                    let outcome = escalate_until_exit(
                        EscalationPlan::foreground_timeout(),
                        process.wait(),
                        |signal| send_signal(SignalTarget::Group(pid), signal),
                    )
                    .await;
                    (outcome.exit.transpose(), true)
                }
            };

        let drain_window = self.config.drain_window;
        let (stdout, stdout_truncated) =
            collect_capture(stdout_reader, &stdout_capture, drain_window).await;
        let (mut stderr, stderr_truncated) =
            collect_capture(stderr_reader, &stderr_capture, drain_window).await;

        let exit_code = match (timed_out, exit) {
            (true, _) => FOREGROUND_TIMEOUT_EXIT_CODE,
            (false, Ok(Some(exit))) => exit.normalized_code(),
            (false, Ok(None)) => FOREGROUND_SPAWN_FAILURE_EXIT_CODE,
            (false, Err(error)) => {
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&error.to_string());
                FOREGROUND_SPAWN_FAILURE_EXIT_CODE
            }
        };
        let result = ForegroundCommandResult {
            stdout,
            stderr,
            exit_code,
            timed_out,
            truncated: stdout_truncated || stderr_truncated,
            duration_ms: elapsed_ms(started),
        };
        tracing::debug!(
            pid,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            truncated = result.truncated,
            duration_ms = result.duration_ms,
            "foreground command finished"
        );
        result
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
