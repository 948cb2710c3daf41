//! Command-line interface for devstats.
//!
//! Provides one subcommand per pipeline stage plus the all-in-one `sync`.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
