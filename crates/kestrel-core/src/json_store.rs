//! Whole-document JSON persistence guarded by an advisory lock file.
//!
//! Stores are read fully and rewritten fully. Callers that read, modify and
//! write a document hold [`StoreLock`] for the duration so two processes
//! sharing a workspace serialize instead of losing each other's updates.
//!
//! Async callers use [`StoreLock::acquire_async`] or
//! [`update_json_document_async`]: the wait for a contended lock happens on
//! the blocking pool and only the short read-modify-write runs on the task.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::atomic_io::write_text_atomic;

/// Exclusive advisory lock on `<store>.lock`, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Blocks until the lock for `store_path` is held by this process.
    pub fn acquire(store_path: &Path) -> Result<Self> {
        let path = store_lock_path(store_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(Self { file, path })
    }

    /// [`StoreLock::acquire`] on the blocking pool.
    pub async fn acquire_async(store_path: &Path) -> Result<Self> {
        let store_path = store_path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire(&store_path))
            .await
            .context("store lock task failed")?
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Returns the sibling lock path used for `store_path`.
pub fn store_lock_path(store_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.lock", store_path.display()))
}

/// Loads a JSON document, yielding `T::default()` when the file is missing or blank.
pub fn load_json_document<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str::<T>(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Rewrites a JSON document atomically (pretty-printed, trailing newline).
pub fn persist_json_document<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize,
{
    let mut payload = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    payload.push('\n');
    write_text_atomic(path, &payload).with_context(|| format!("failed to write {}", path.display()))
}

/// Runs `mutate` on the freshly loaded document under the store lock.
///
/// The document is written back only when `mutate` reports a change.
pub fn update_json_document<T, R, F>(path: &Path, mutate: F) -> Result<R>
where
    T: DeserializeOwned + Serialize + Default,
    F: FnOnce(&mut T) -> Result<(R, bool)>,
{
    let _lock = StoreLock::acquire(path)?;
    mutate_locked_document(path, mutate)
}

/// [`update_json_document`] for async callers; the lock wait does not block the executor.
pub async fn update_json_document_async<T, R, F>(path: &Path, mutate: F) -> Result<R>
where
    T: DeserializeOwned + Serialize + Default,
    F: FnOnce(&mut T) -> Result<(R, bool)>,
{
    let _lock = StoreLock::acquire_async(path).await?;
    mutate_locked_document(path, mutate)
}

fn mutate_locked_document<T, R, F>(path: &Path, mutate: F) -> Result<R>
where
    T: DeserializeOwned + Serialize + Default,
    F: FnOnce(&mut T) -> Result<(R, bool)>,
{
    let mut document = load_json_document::<T>(path)?;
    let (result, changed) = mutate(&mut document)?;
    if changed {
        persist_json_document(path, &document)?;
    }
    Ok(result)
}
