//! Approval capability consulted before any process is spawned.
//!
//! Runners take an `Arc<dyn ApprovalGate>` in their constructors; there is no
//! process-wide approval hook.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    RunCommand,
    StartBackgroundJob,
}

impl ApprovalAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunCommand => "run_command",
            Self::StartBackgroundJob => "start_background_job",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    pub action: ApprovalAction,
    pub summary: String,
    pub command: String,
    pub cwd: PathBuf,
}

impl ApprovalRequest {
    pub fn run_command(command: &str, cwd: PathBuf) -> Self {
        Self {
            action: ApprovalAction::RunCommand,
            summary: format!("run `{command}` in {}", cwd.display()),
            command: command.to_string(),
            cwd,
        }
    }

    pub fn start_background_job(command: &str, cwd: PathBuf) -> Self {
        Self {
            action: ApprovalAction::StartBackgroundJob,
            summary: format!("start background job `{command}` in {}", cwd.display()),
            command: command.to_string(),
            cwd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: String },
}

impl ApprovalDecision {
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn review(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApproveGate;

#[async_trait]
impl ApprovalGate for AutoApproveGate {
    async fn review(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}

/// Denies everything with a fixed reason.
#[derive(Debug, Clone)]
pub struct DenyAllGate {
    reason: String,
}

impl DenyAllGate {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for DenyAllGate {
    fn default() -> Self {
        Self::new("approval mode denies all process launches")
    }
}

#[async_trait]
impl ApprovalGate for DenyAllGate {
    async fn review(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::denied(self.reason.clone())
    }
}

/// Adapts a synchronous closure into a gate.
pub struct FnApprovalGate<F> {
    decide: F,
}

impl<F> FnApprovalGate<F>
where
    F: Fn(&ApprovalRequest) -> ApprovalDecision + Send + Sync,
{
    pub fn new(decide: F) -> Self {
        Self { decide }
    }
}

#[async_trait]
impl<F> ApprovalGate for FnApprovalGate<F>
where
    F: Fn(&ApprovalRequest) -> ApprovalDecision + Send + Sync,
{
    async fn review(&self, request: &ApprovalRequest) -> ApprovalDecision {
        (self.decide)(request)
    }
}

/// Asks the operator on stderr and reads the answer from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct InteractiveApprovalGate;

#[async_trait]
impl ApprovalGate for InteractiveApprovalGate {
    async fn review(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let prompt = format!("approve {}? [y/N] ", request.summary);
        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{prompt}");
            let _ = stderr.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) if parse_approval_answer(&line) => ApprovalDecision::Approved,
            Ok(Ok(_)) => ApprovalDecision::denied("operator declined"),
            Ok(Err(error)) => ApprovalDecision::denied(format!("failed to read approval: {error}")),
            Err(error) => ApprovalDecision::denied(format!("approval prompt aborted: {error}")),
        }
    }
}

/// Accepts `y` and `yes` in any case; everything else is a denial.
pub fn parse_approval_answer(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Operator-selectable approval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    Auto,
    Deny,
    Prompt,
}

impl ApprovalMode {
    pub fn into_gate(self) -> Arc<dyn ApprovalGate> {
        match self {
            Self::Auto => Arc::new(AutoApproveGate),
            Self::Deny => Arc::new(DenyAllGate::default()),
            Self::Prompt => Arc::new(InteractiveApprovalGate),
        }
    }
}
