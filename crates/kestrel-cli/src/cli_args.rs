use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{parse_positive_u64, parse_positive_usize, CliApprovalMode};

#[derive(Debug, Parser)]
#[command(
    name = "kestrel",
    about = "Process and job orchestration for the Kestrel automation agent",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "KESTREL_WORKSPACE",
        default_value = ".",
        global = true,
        help = "Workspace root; commands run here and state lives below it by default."
    )]
    pub workspace: PathBuf,

    #[arg(
        long = "state-dir",
        env = "KESTREL_STATE_DIR",
        global = true,
        help = "Runtime state directory. Relative paths resolve against --workspace (default: .kestrel)."
    )]
    pub state_dir: Option<PathBuf>,

    #[arg(
        long = "approval-mode",
        env = "KESTREL_APPROVAL_MODE",
        value_enum,
        default_value_t = CliApprovalMode::Auto,
        global = true,
        help = "How process launches are approved: auto, deny, or prompt on the terminal."
    )]
    pub approval_mode: CliApprovalMode,

    #[arg(
        long,
        env = "KESTREL_SHELL",
        global = true,
        help = "Shell used for `-c` command execution (default: $SHELL, else sh)."
    )]
    pub shell: Option<String>,

    #[command(subcommand)]
    pub command: KestrelCommand,
}

#[derive(Debug, Subcommand)]
pub enum KestrelCommand {
    /// Manage the periodic heartbeat daemon
    Heartbeat {
        #[command(subcommand)]
        action: HeartbeatCommand,
    },
    /// Run commands and manage background jobs
    Exec {
        #[command(subcommand)]
        action: ExecCommand,
    },
    /// Record audio with the first available recorder
    Voice {
        #[command(subcommand)]
        action: VoiceCommand,
    },
}

#[derive(Debug, Clone, Copy, Args)]
pub struct PollIntervalArgs {
    #[arg(
        long = "poll-seconds",
        value_parser = parse_positive_u64,
        help = "Seconds between heartbeat batches (default 60, minimum 15)."
    )]
    pub poll_seconds: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum HeartbeatCommand {
    /// Start the detached heartbeat daemon unless one is running
    Start(PollIntervalArgs),
    /// Stop the recorded heartbeat daemon
    Stop,
    /// Report whether the heartbeat daemon is running
    Status,
    /// Run one batch of due tasks in the foreground
    Once,
    /// Run the heartbeat loop in the foreground until signaled
    Run(PollIntervalArgs),
}

#[derive(Debug, Subcommand)]
pub enum ExecCommand {
    /// Run a shell command to completion
    Run {
        /// Shell command text
        command: String,
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long = "timeout-ms", value_parser = parse_positive_u64)]
        timeout_ms: Option<u64>,
        #[arg(long = "max-output-chars", value_parser = parse_positive_usize)]
        max_output_chars: Option<usize>,
    },
    /// Start a detached background job
    StartBackground {
        /// Shell command text
        command: String,
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
    /// List background jobs, newest first
    ListBackground,
    /// Show one background job and the tail of its log
    StatusBackground {
        job_id: String,
        #[arg(long = "log-tail-bytes", value_parser = parse_positive_usize)]
        log_tail_bytes: Option<usize>,
    },
    /// Send SIGTERM to a background job
    StopBackground { job_id: String },
}

#[derive(Debug, Subcommand)]
pub enum VoiceCommand {
    /// Record for a fixed number of seconds
    Record {
        #[arg(long, default_value_t = 5, value_parser = parse_positive_u64)]
        seconds: u64,
    },
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::{Cli, ExecCommand, HeartbeatCommand, KestrelCommand, VoiceCommand};
    use crate::CliApprovalMode;

    #[test]
    fn unit_global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "kestrel",
            "heartbeat",
            "run",
            "--poll-seconds",
            "30",
            "--workspace",
            "/work",
            "--state-dir",
            "state",
            "--approval-mode",
            "deny",
        ])
        .expect("parse");
        assert_eq!(cli.workspace, PathBuf::from("/work"));
        assert_eq!(cli.state_dir, Some(PathBuf::from("state")));
        assert_eq!(cli.approval_mode, CliApprovalMode::Deny);
        match cli.command {
            KestrelCommand::Heartbeat {
                action: HeartbeatCommand::Run(args),
            } => assert_eq!(args.poll_seconds, Some(30)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unit_exec_run_takes_command_text_and_limits() {
        let cli = Cli::try_parse_from([
            "kestrel",
            "exec",
            "run",
            "echo hi; exit 3",
            "--timeout-ms",
            "2000",
        ])
        .expect("parse");
        match cli.command {
            KestrelCommand::Exec {
                action:
                    ExecCommand::Run {
                        command,
                        timeout_ms,
                        max_output_chars,
                        ..
                    },
            } => {
                assert_eq!(command, "echo hi; exit 3");
                assert_eq!(timeout_ms, Some(2000));
                assert_eq!(max_output_chars, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn regression_zero_values_are_rejected() {
        assert!(Cli::try_parse_from(["kestrel", "heartbeat", "start", "--poll-seconds", "0"]).is_err());
        assert!(Cli::try_parse_from(["kestrel", "voice", "record", "--seconds", "0"]).is_err());
        assert!(Cli::try_parse_from(["kestrel", "exec", "status-background"]).is_err());
    }

    #[test]
    fn unit_voice_record_defaults_to_five_seconds() {
        let cli = Cli::try_parse_from(["kestrel", "voice", "record"]).expect("parse");
        match cli.command {
            KestrelCommand::Voice {
                action: VoiceCommand::Record { seconds },
            } => assert_eq!(seconds, 5),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
