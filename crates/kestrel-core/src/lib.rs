//! Foundational low-level utilities shared across Kestrel crates.
//!
//! Provides atomic file writes, locked JSON documents, rotated JSONL logs and
//! time helpers used by job stores, heartbeat state and runtime records.

pub mod atomic_io;
pub mod json_store;
pub mod log_rotation;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use json_store::{
    load_json_document, persist_json_document, store_lock_path, update_json_document,
    update_json_document_async, StoreLock,
};
pub use log_rotation::{append_line_with_rotation, LogRotationPolicy};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, current_utc_rfc3339};
