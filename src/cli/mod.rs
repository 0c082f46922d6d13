//! Command-line interface for mood-forge.
//!
//! Provides the coordinator server, the hidden worker unit entry point and
//! client commands for submitting and inspecting jobs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
