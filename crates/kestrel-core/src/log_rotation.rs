//! Size-capped JSONL event logs with numbered backups (`events.jsonl.1`, ...).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};

const LOG_MAX_BYTES_ENV: &str = "KESTREL_LOG_ROTATION_MAX_BYTES";
const LOG_MAX_FILES_ENV: &str = "KESTREL_LOG_ROTATION_MAX_FILES";
const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_MAX_FILES: usize = 3;

/// How large the active log may grow and how many files (active included) survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

fn positive_env<T>(name: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}

impl LogRotationPolicy {
    /// Defaults overridden by `KESTREL_LOG_ROTATION_MAX_BYTES` / `_MAX_FILES`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_bytes: positive_env(LOG_MAX_BYTES_ENV).unwrap_or(defaults.max_bytes),
            max_files: positive_env(LOG_MAX_FILES_ENV).unwrap_or(defaults.max_files),
        }
    }

    pub fn is_enabled(self) -> bool {
        self.max_bytes > 0 && self.max_files > 0
    }

    fn needs_rotation(self, current_len: u64, line: &str) -> bool {
        let incoming = u64::try_from(line.len()).unwrap_or(u64::MAX).saturating_add(1);
        self.is_enabled() && current_len > 0 && current_len.saturating_add(incoming) > self.max_bytes
    }
}

fn backup_path(path: &Path, generation: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Appends `line` plus a newline, shifting backups first when it would overflow.
pub fn append_line_with_rotation(path: &Path, line: &str, policy: LogRotationPolicy) -> Result<()> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let current_len = match std::fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => 0,
        Err(error) => {
            return Err(error).with_context(|| format!("failed to stat {}", path.display()))
        }
    };
    if policy.needs_rotation(current_len, line) {
        shift_backups(path, policy.max_files)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(format!("{line}\n").as_bytes())
        .with_context(|| format!("failed to append {}", path.display()))
}

/// `path.N-1` -> `path.N` down to `path` -> `path.1`; the oldest generation is dropped.
fn shift_backups(path: &Path, max_files: usize) -> Result<()> {
    let oldest = max_files.saturating_sub(1);
    if oldest == 0 {
        return remove_if_present(path);
    }
    remove_if_present(&backup_path(path, oldest))?;
    for generation in (1..=oldest).rev() {
        let from = match generation {
            1 => path.to_path_buf(),
            older => backup_path(path, older - 1),
        };
        if !from.exists() {
            continue;
        }
        let to = backup_path(path, generation);
        std::fs::rename(&from, &to)
            .with_context(|| format!("failed to move {} to {}", from.display(), to.display()))?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error).with_context(|| format!("failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::{append_line_with_rotation, backup_path, LogRotationPolicy};

    fn read(path: &std::path::Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn unit_full_log_moves_to_first_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        let policy = LogRotationPolicy {
            max_bytes: 32,
            max_files: 3,
        };

        append_line_with_rotation(&path, r#"{"job":"job-1","event":"started"}"#, policy)
            .expect("append first");
        append_line_with_rotation(&path, r#"{"job":"job-1","event":"stopped"}"#, policy)
            .expect("append second");

        assert!(read(&backup_path(&path, 1)).contains("started"));
        assert!(read(&path).contains("stopped"));
        assert!(!read(&path).contains("started"));
    }

    #[test]
    fn regression_backups_never_exceed_max_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        let policy = LogRotationPolicy {
            max_bytes: 12,
            max_files: 2,
        };

        for seq in 1..=5 {
            append_line_with_rotation(&path, &format!(r#"{{"seq":{seq}}}"#), policy)
                .expect("append line");
        }

        assert!(read(&backup_path(&path, 1)).contains("\"seq\":4"));
        assert!(!backup_path(&path, 2).exists());
        assert!(read(&path).contains("\"seq\":5"));
    }

    #[test]
    fn unit_single_file_policy_truncates_instead_of_keeping_backups() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("heartbeat").join("events.jsonl");
        let policy = LogRotationPolicy {
            max_bytes: 10,
            max_files: 1,
        };
        append_line_with_rotation(&path, "first-line", policy).expect("first");
        append_line_with_rotation(&path, "second-line", policy).expect("second");
        assert_eq!(read(&path), "second-line\n");
        assert!(!backup_path(&path, 1).exists());
    }

    #[test]
    fn unit_disabled_policy_only_appends() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        let policy = LogRotationPolicy {
            max_bytes: 0,
            max_files: 0,
        };
        for seq in 1..=3 {
            append_line_with_rotation(&path, &format!("line-{seq}"), policy).expect("append");
        }
        assert_eq!(read(&path).lines().count(), 3);
        assert!(!backup_path(&path, 1).exists());
    }
}
