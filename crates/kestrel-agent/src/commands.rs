use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kestrel_cli::{
    Cli, CliApprovalMode, ExecCommand, HeartbeatCommand, KestrelCommand, VoiceCommand,
};
use kestrel_runtime::{
    clamp_poll_interval, default_heartbeat_registry, heartbeat_daemon_status,
    record_for_duration, run_heartbeat_daemon_loop, run_heartbeat_once, shell_program,
    start_heartbeat_daemon, stop_heartbeat_daemon, wait_for_shutdown_signal, ApprovalGate,
    ApprovalMode, BackgroundJobRequest, BackgroundJobRuntime, BackgroundJobRuntimeConfig,
    BackgroundLaunchOutcome, CommandRunOutcome, ForegroundCommandConfig, ForegroundCommandRequest,
    ForegroundCommandRunner, HeartbeatDaemonConfig, JsonHeartbeatPlanSource, VoiceRecorderConfig,
    WorkspaceLayout, BACKGROUND_JOB_DEFAULT_LOG_TAIL_BYTES,
};
use serde::Serialize;
use serde_json::json;

pub(crate) const APPROVAL_DENIED_EXIT_CODE: i32 = 3;
pub(crate) const UNKNOWN_JOB_EXIT_CODE: i32 = 1;
pub(crate) const HEARTBEAT_FAILURE_EXIT_CODE: i32 = 1;

struct CommandContext {
    layout: WorkspaceLayout,
    shell: String,
    approval_mode: CliApprovalMode,
    explicit_shell: Option<String>,
    gate: Arc<dyn ApprovalGate>,
}

impl CommandContext {
    fn from_cli(cli: &Cli) -> Self {
        let layout = WorkspaceLayout::new(&cli.workspace, cli.state_dir.as_deref());
        let shell = cli.shell.clone().unwrap_or_else(shell_program);
        Self {
            layout,
            shell,
            approval_mode: cli.approval_mode,
            explicit_shell: cli.shell.clone(),
            gate: ApprovalMode::from(cli.approval_mode).into_gate(),
        }
    }

    fn foreground_runner(&self) -> ForegroundCommandRunner {
        ForegroundCommandRunner::new(
            ForegroundCommandConfig {
                shell: self.shell.clone(),
                ..ForegroundCommandConfig::for_workspace(self.layout.workspace())
            },
            Arc::clone(&self.gate),
        )
    }

    fn background_jobs(&self) -> Result<BackgroundJobRuntime> {
        BackgroundJobRuntime::new(
            BackgroundJobRuntimeConfig {
                state_dir: self.layout.jobs_dir(),
                shell: self.shell.clone(),
                default_cwd: self.layout.workspace().to_path_buf(),
            },
            Arc::clone(&self.gate),
        )
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render JSON output")?;
    println!("{rendered}");
    Ok(())
}

fn print_denial(action: &str, reason: &str) -> Result<i32> {
    print_json(&json!({
        "action": action,
        "denied": true,
        "reason": reason,
    }))?;
    Ok(APPROVAL_DENIED_EXIT_CODE)
}

fn print_unknown_job(job_id: &str) -> Result<i32> {
    print_json(&json!({
        "error": format!("unknown background job '{job_id}'"),
        "job_id": job_id,
    }))?;
    Ok(UNKNOWN_JOB_EXIT_CODE)
}

/// Dispatches one CLI invocation and returns the process exit code.
pub(crate) async fn run_cli(cli: Cli) -> Result<i32> {
    let context = CommandContext::from_cli(&cli);
    match cli.command {
        KestrelCommand::Heartbeat { action } => run_heartbeat_command(&context, action).await,
        KestrelCommand::Exec { action } => run_exec_command(&context, action).await,
        KestrelCommand::Voice { action } => run_voice_command(&context, action).await,
    }
}

async fn run_heartbeat_command(context: &CommandContext, action: HeartbeatCommand) -> Result<i32> {
    let layout = &context.layout;
    match action {
        HeartbeatCommand::Start(args) => {
            let poll_interval = clamp_poll_interval(args.poll_seconds);
            let mut config = HeartbeatDaemonConfig::for_layout(layout.clone(), poll_interval);
            config.args.push("--approval-mode".to_string());
            config.args.push(context.approval_mode.as_str().to_string());
            if let Some(shell) = context.explicit_shell.as_ref() {
                config.args.push("--shell".to_string());
                config.args.push(shell.clone());
            }
            print_json(&start_heartbeat_daemon(&config)?)?;
            Ok(0)
        }
        HeartbeatCommand::Stop => {
            print_json(&stop_heartbeat_daemon(layout)?)?;
            Ok(0)
        }
        HeartbeatCommand::Status => {
            print_json(&heartbeat_daemon_status(layout)?)?;
            Ok(0)
        }
        HeartbeatCommand::Once => {
            layout.ensure()?;
            let registry =
                default_heartbeat_registry(layout, Arc::clone(&context.gate), &context.shell)?;
            let plan = JsonHeartbeatPlanSource::new(layout.heartbeat_plan_path());
            let report = run_heartbeat_once(layout, &plan, &registry).await?;
            print_json(&json!({
                "all_ok": report.all_ok(),
                "urgent": report.has_urgent(),
                "report": report,
            }))?;
            Ok(if report.all_ok() {
                0
            } else {
                HEARTBEAT_FAILURE_EXIT_CODE
            })
        }
        HeartbeatCommand::Run(args) => {
            let registry =
                default_heartbeat_registry(layout, Arc::clone(&context.gate), &context.shell)?;
            let plan = JsonHeartbeatPlanSource::new(layout.heartbeat_plan_path());
            let summary = run_heartbeat_daemon_loop(
                layout,
                clamp_poll_interval(args.poll_seconds),
                &plan,
                &registry,
                wait_for_shutdown_signal(),
            )
            .await?;
            print_json(&summary)?;
            Ok(0)
        }
    }
}

async fn run_exec_command(context: &CommandContext, action: ExecCommand) -> Result<i32> {
    match action {
        ExecCommand::Run {
            command,
            cwd,
            timeout_ms,
            max_output_chars,
        } => {
            let request = ForegroundCommandRequest {
                command,
                cwd,
                timeout_ms,
                max_output_chars,
            };
            match context.foreground_runner().run(&request).await {
                CommandRunOutcome::Denied { reason } => print_denial("run", &reason),
                CommandRunOutcome::Completed(result) => {
                    print_json(&result)?;
                    Ok(result.exit_code)
                }
            }
        }
        ExecCommand::StartBackground { command, cwd } => {
            let jobs = context.background_jobs()?;
            match jobs.start_job(&BackgroundJobRequest { command, cwd }).await? {
                BackgroundLaunchOutcome::Denied { reason } => {
                    print_denial("start_background", &reason)
                }
                BackgroundLaunchOutcome::Started(job) => {
                    print_json(&job)?;
                    Ok(0)
                }
            }
        }
        ExecCommand::ListBackground => {
            let jobs = context.background_jobs()?.list_jobs()?;
            print_json(&json!({ "count": jobs.len(), "jobs": jobs }))?;
            Ok(0)
        }
        ExecCommand::StatusBackground {
            job_id,
            log_tail_bytes,
        } => {
            let jobs = context.background_jobs()?;
            let Some(job) = jobs.job_status(&job_id)? else {
                return print_unknown_job(&job_id);
            };
            let log_tail = jobs
                .read_job_log_tail(
                    &job_id,
                    log_tail_bytes.unwrap_or(BACKGROUND_JOB_DEFAULT_LOG_TAIL_BYTES),
                )?
                .unwrap_or_default();
            print_json(&json!({
                "job": job,
                "failure_shaped": job.status.is_failure_shaped(),
                "log_tail": log_tail,
            }))?;
            Ok(0)
        }
        ExecCommand::StopBackground { job_id } => {
            let Some(report) = context.background_jobs()?.stop_job(&job_id)? else {
                return print_unknown_job(&job_id);
            };
            print_json(&report)?;
            Ok(0)
        }
    }
}

async fn run_voice_command(context: &CommandContext, action: VoiceCommand) -> Result<i32> {
    match action {
        VoiceCommand::Record { seconds } => {
            let config = VoiceRecorderConfig::for_output_dir(context.layout.voice_dir());
            let report = record_for_duration(&config, Duration::from_secs(seconds))
                .await
                .context("voice recording failed")?;
            print_json(&report)?;
            Ok(0)
        }
    }
}
