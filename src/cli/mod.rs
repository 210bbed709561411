//! Command-line interface for qsm-ci.
//!
//! Provides commands for grouping a dataset and running algorithms against it.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
