//! CLI argument definitions using clap
//!
//! Commands:
//! - peerrecovery files --dir <store>
//! - peerrecovery diff --source <store> --target <store>
//! - peerrecovery recover --source <shard dir> --target <shard dir> [--config <path>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Peer shard recovery tooling
#[derive(Parser, Debug)]
#[command(name = "peerrecovery")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log every event, including per-file and per-batch progress
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the file metadata of a store
    Files {
        /// Store directory
        #[arg(long)]
        dir: PathBuf,
    },

    /// Show which files a recovery would send and which it would reuse
    Diff {
        /// Store directory of the source copy
        #[arg(long)]
        source: PathBuf,

        /// Store directory of the target copy
        #[arg(long)]
        target: PathBuf,
    },

    /// Recover one shard directory from another, in process
    Recover {
        /// Source shard directory (`index/` and `translog/`)
        #[arg(long)]
        source: PathBuf,

        /// Target shard directory, created if missing
        #[arg(long)]
        target: PathBuf,

        /// Recovery settings file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Index name used to identify the shard in logs
        #[arg(long, default_value = "local")]
        index: String,

        /// Shard number used to identify the shard in logs
        #[arg(long, default_value_t = 0)]
        shard: u32,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
