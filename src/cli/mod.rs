//! Command-line interface for pattern-forge.
//!
//! Provides commands for dataset generation and pattern linting/checking.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
