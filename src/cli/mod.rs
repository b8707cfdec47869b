//! Command-line interface for stephub.
//!
//! Provides the `serve` entry point plus thin client commands for
//! inspecting and administering a running hub.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
