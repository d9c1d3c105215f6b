//! Failure taxonomy for spawned OS processes.

use std::path::PathBuf;

use thiserror::Error;

/// Maximum number of stderr characters carried by [`ProcessRuntimeError::AbnormalExit`].
pub const ABNORMAL_EXIT_STDERR_PREVIEW_CHARS: usize = 2_000;

/// One recorder candidate that could not be started, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderCandidateFailure {
    pub label: String,
    pub reason: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessRuntimeError {
    #[error("failed to spawn '{program}': {detail}")]
    SpawnFailure {
        program: String,
        kind: std::io::ErrorKind,
        detail: String,
    },
    #[error("failed to deliver {signal} to {target}: {detail}")]
    Signal {
        target: String,
        signal: &'static str,
        errno: i32,
        detail: String,
    },
    #[error("failed to wait for '{program}': {detail}")]
    Wait { program: String, detail: String },
    #[error("{label} exited abnormally (code {}): {stderr_preview}", format_exit_code(.code))]
    AbnormalExit {
        label: String,
        code: Option<i32>,
        stderr_preview: String,
    },
    #[error("recording '{}' is missing or empty", .path.display())]
    EmptyRecording { path: PathBuf },
    #[error("no recorder available: {}", format_candidate_failures(.attempts))]
    NoRecorderAvailable {
        attempts: Vec<RecorderCandidateFailure>,
    },
}

impl ProcessRuntimeError {
    pub(crate) fn spawn_failure(program: &str, error: &std::io::Error) -> Self {
        Self::SpawnFailure {
            program: program.to_string(),
            kind: error.kind(),
            detail: error.to_string(),
        }
    }

    /// Returns true when a signal failed only because the target is already gone.
    pub fn is_no_such_process(&self) -> bool {
        matches!(self, Self::Signal { errno, .. } if *errno == libc_esrch())
    }
}

/// Truncates stderr to the preview budget, keeping the tail where errors usually land.
pub fn stderr_preview(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let total = trimmed.chars().count();
    if total <= ABNORMAL_EXIT_STDERR_PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let skip = total - ABNORMAL_EXIT_STDERR_PREVIEW_CHARS;
    let tail = trimmed.chars().skip(skip).collect::<String>();
    format!("<output truncated>\n{tail}")
}

fn format_exit_code(code: &Option<i32>) -> String {
    code.map(|value| value.to_string())
        .unwrap_or_else(|| "none".to_string())
}

fn format_candidate_failures(attempts: &[RecorderCandidateFailure]) -> String {
    if attempts.is_empty() {
        return "no candidates configured".to_string();
    }
    attempts
        .iter()
        .map(|attempt| format!("{} ({})", attempt.label, attempt.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(unix)]
pub(crate) fn libc_esrch() -> i32 {
    libc::ESRCH
}

#[cfg(not(unix))]
pub(crate) fn libc_esrch() -> i32 {
    3
}

#[cfg(test)]
mod tests {
    use super::{
        stderr_preview, ProcessRuntimeError, RecorderCandidateFailure,
        ABNORMAL_EXIT_STDERR_PREVIEW_CHARS,
    };

    #[test]
    fn unit_no_recorder_available_lists_every_candidate_reason() {
        let error = ProcessRuntimeError::NoRecorderAvailable {
            attempts: vec![
                RecorderCandidateFailure {
                    label: "arecord".to_string(),
                    reason: "not installed".to_string(),
                },
                RecorderCandidateFailure {
                    label: "ffmpeg (pulse)".to_string(),
                    reason: "permission denied".to_string(),
                },
            ],
        };
        let rendered = error.to_string();
        assert!(rendered.contains("arecord (not installed)"));
        assert!(rendered.contains("ffmpeg (pulse) (permission denied)"));
    }

    #[test]
    fn unit_stderr_preview_keeps_tail_within_budget() {
        let long = format!("{}END", "x".repeat(ABNORMAL_EXIT_STDERR_PREVIEW_CHARS * 2));
        let preview = stderr_preview(&long);
        assert!(preview.starts_with("<output truncated>"));
        assert!(preview.ends_with("END"));
        assert_eq!(
            preview.trim_start_matches("<output truncated>\n").chars().count(),
            ABNORMAL_EXIT_STDERR_PREVIEW_CHARS
        );
        assert_eq!(stderr_preview("  short  "), "short");
    }

    #[test]
    fn unit_abnormal_exit_renders_missing_code_as_none() {
        let error = ProcessRuntimeError::AbnormalExit {
            label: "arecord".to_string(),
            code: None,
            stderr_preview: "device busy".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "arecord exited abnormally (code none): device busy"
        );
    }
}
