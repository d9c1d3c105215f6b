use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const DEFAULT_STATE_DIR_NAME: &str = ".kestrel";
const JOBS_DIR: &str = "jobs";
const HEARTBEAT_DIR: &str = "heartbeat";
const TMP_DIR: &str = "tmp";
const VOICE_DIR: &str = "voice";
const HEARTBEAT_STATE_FILE: &str = "state.json";
const HEARTBEAT_RUNTIME_FILE: &str = "runtime.json";
const HEARTBEAT_PLAN_FILE: &str = "plan.json";
const HEARTBEAT_DAEMON_LOG_FILE: &str = "daemon.log";
const HEARTBEAT_EVENTS_FILE: &str = "events.jsonl";

/// `path` unchanged when absolute, else joined onto `base`.
pub fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn absolute_from_process_cwd(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "failed to resolve workspace against current dir"
            );
            path
        }
    }
}

/// Resolved on-disk locations for one workspace's runtime state.
///
/// Both paths are absolute, so they survive being handed to a child process
/// that runs with the workspace as its cwd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    workspace: PathBuf,
    state_dir: PathBuf,
}

impl WorkspaceLayout {
    /// A relative `workspace` resolves against the process cwd; a relative
    /// `state_dir` resolves against `workspace`.
    pub fn new(workspace: impl Into<PathBuf>, state_dir: Option<&Path>) -> Self {
        let workspace = absolute_from_process_cwd(workspace.into());
        let state_dir = match state_dir {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => workspace.join(dir),
            None => workspace.join(DEFAULT_STATE_DIR_NAME),
        };
        Self {
            workspace,
            state_dir,
        }
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.as_path()
    }

    pub fn state_dir(&self) -> &Path {
        self.state_dir.as_path()
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join(JOBS_DIR)
    }

    pub fn heartbeat_dir(&self) -> PathBuf {
        self.state_dir.join(HEARTBEAT_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_dir.join(TMP_DIR)
    }

    pub fn voice_dir(&self) -> PathBuf {
        self.state_dir.join(VOICE_DIR)
    }

    pub fn heartbeat_state_path(&self) -> PathBuf {
        self.heartbeat_dir().join(HEARTBEAT_STATE_FILE)
    }

    pub fn heartbeat_runtime_path(&self) -> PathBuf {
        self.heartbeat_dir().join(HEARTBEAT_RUNTIME_FILE)
    }

    pub fn heartbeat_plan_path(&self) -> PathBuf {
        self.heartbeat_dir().join(HEARTBEAT_PLAN_FILE)
    }

    pub fn heartbeat_daemon_log_path(&self) -> PathBuf {
        self.heartbeat_dir().join(HEARTBEAT_DAEMON_LOG_FILE)
    }

    pub fn heartbeat_events_path(&self) -> PathBuf {
        self.heartbeat_dir().join(HEARTBEAT_EVENTS_FILE)
    }

    /// Creates every runtime directory.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.jobs_dir(),
            self.heartbeat_dir(),
            self.tmp_dir(),
            self.voice_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
