//! Command-line interface for stagecrew.
//!
//! Provides the `run` and `validate` subcommands and the process exit-code
//! conventions (0 success, 1 bounded failure, 2 configuration, 143
//! cancelled).

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, RunArgs, ValidateArgs};
