//! CLI argument models for the `kestrel` binary.
//!
//! Exposes the clap command tree plus the value enums and parsers shared by
//! command dispatch.

pub mod cli_args;
pub mod cli_types;

pub use cli_args::*;
pub use cli_types::*;
