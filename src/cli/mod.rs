//! Command-line interface for nqs.
//!
//! Provides commands for running configured queues and inspecting their
//! storage.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
