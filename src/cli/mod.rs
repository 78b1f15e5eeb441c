//! CLI module
//!
//! Provides command-line tooling for:
//! - files: list a store's file metadata
//! - diff: show the recovery inventory between two stores
//! - recover: run one local recovery and report both sides

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{
    diff_stores, files, recover, run, run_command, run_local_recovery,
    RecoveryReport, INDEX_DIR,
};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{error_envelope, ok_envelope, write_error, write_response};
