//! Process and job orchestration runtime for Kestrel.
//!
//! Spawns and supervises OS processes (foreground commands, detached
//! background jobs, audio recorders, the heartbeat daemon) and reconciles
//! their persisted state across controller restarts.

pub mod approval_gate;
pub mod background_jobs_runtime;
pub mod foreground_command_runtime;
pub mod heartbeat_daemon_runtime;
pub mod heartbeat_executors_runtime;
pub mod heartbeat_scheduler_runtime;
mod output_capture_runtime;
pub mod process_runtime_error;
pub mod process_spawn_runtime;
pub mod termination_escalation;
pub mod voice_recorder_runtime;
pub mod workspace_layout;

pub use approval_gate::*;
pub use background_jobs_runtime::*;
pub use foreground_command_runtime::*;
pub use heartbeat_daemon_runtime::*;
pub use heartbeat_executors_runtime::*;
pub use heartbeat_scheduler_runtime::*;
pub use output_capture_runtime::StreamCapture;
pub use process_runtime_error::*;
pub use process_spawn_runtime::*;
pub use termination_escalation::*;
pub use voice_recorder_runtime::*;
pub use workspace_layout::*;
