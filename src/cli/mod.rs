//! Command-line interface for render-queue.
//!
//! Provides commands for submitting jobs, running workers and inspecting
//! queue state.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, JobFile};
