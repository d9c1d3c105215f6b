use std::io::IsTerminal;

use kestrel_cli::{Cli, HeartbeatCommand, KestrelCommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Takes precedence over `RUST_LOG`.
pub(crate) const KESTREL_LOG_ENV: &str = "KESTREL_LOG";

/// The daemon's stderr is `heartbeat/daemon.log`, so it logs batches by default.
pub(crate) fn default_log_level(cli: &Cli) -> LevelFilter {
    match &cli.command {
        KestrelCommand::Heartbeat {
            action: HeartbeatCommand::Run(_),
        } => LevelFilter::INFO,
        _ => LevelFilter::WARN,
    }
}

fn env_filter(default_level: LevelFilter) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(default_level.into());
    match std::env::var(KESTREL_LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => builder.parse_lossy(directives),
        _ => builder.from_env_lossy(),
    }
}

/// Logs go to stderr so stdout stays machine-readable JSON.
pub(crate) fn init_tracing(cli: &Cli) {
    let stderr_is_terminal = std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_log_level(cli)))
        .with_target(false)
        .with_ansi(stderr_is_terminal)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use kestrel_cli::Cli;
    use tracing::level_filters::LevelFilter;

    use super::default_log_level;

    #[test]
    fn unit_daemon_loop_defaults_to_info_and_other_commands_to_warn() {
        let daemon = Cli::parse_from(["kestrel", "heartbeat", "run"]);
        assert_eq!(default_log_level(&daemon), LevelFilter::INFO);

        let once = Cli::parse_from(["kestrel", "heartbeat", "once"]);
        assert_eq!(default_log_level(&once), LevelFilter::WARN);

        let exec = Cli::parse_from(["kestrel", "exec", "list-background"]);
        assert_eq!(default_log_level(&exec), LevelFilter::WARN);
    }
}
