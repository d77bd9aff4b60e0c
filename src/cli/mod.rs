//! Command-line interface for pipeforge.
//!
//! Provides commands for running pipeline plans, listing plugins, applying
//! migrations and inspecting pipeline status.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
