//! CLI command implementations
//!
//! A shard directory holds the store under `index/` and the operation log
//! under `translog/`. Every command prints one JSON object on stdout.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::engine::InMemoryEngine;
use crate::observability::{Event, Logger, MetricsRegistry, MetricsSnapshot, Severity};
use crate::recovery::{
    diff, load_segments, LocalTransport, RecoveryManager, RecoverySettings, RecoverySource,
    RecoveryStateSnapshot, RecoveryTargetService,
};
use crate::shard::{IndexId, NodeId, ShardId};
use crate::store::ShardStore;
use crate::translog::Translog;

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// Store directory inside a shard directory
pub const INDEX_DIR: &str = "index";

/// Parse arguments and run the command
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    if cli.verbose {
        Logger::set_min_severity(Severity::Trace);
    }
    run_command(cli.command)
}

/// Dispatch a parsed command
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Files { dir } => files(&dir),
        Command::Diff { source, target } => diff_stores(&source, &target),
        Command::Recover {
            source,
            target,
            config,
            index,
            shard,
        } => {
            let settings = match config {
                Some(path) => RecoverySettings::load(&path)?,
                None => RecoverySettings::default(),
            };
            Logger::event(
                Event::ConfigLoaded,
                &[
                    ("max_concurrent_recoveries", &settings.max_concurrent_recoveries.to_string()),
                    ("chunk_size_bytes", &settings.chunk_size_bytes.to_string()),
                ],
            );
            let shard_id = ShardId::new(IndexId::new(index, "local"), shard);
            recover(&source, &target, settings, shard_id)
        }
    }
}

/// `files`: list a store's file metadata
pub fn files(dir: &Path) -> CliResult<()> {
    let store = ShardStore::open(dir)?;
    let files = store.list_metadata()?;
    let total_bytes: u64 = files.iter().map(|f| f.length).sum();
    write_response(json!({
        "files": files,
        "total_bytes": total_bytes,
    }))
}

/// `diff`: what a recovery from `source` into `target` would send
pub fn diff_stores(source: &Path, target: &Path) -> CliResult<()> {
    let source_files = ShardStore::open(source)?.list_metadata()?;
    let target_files = ShardStore::open(target)?.list_metadata()?;
    let inventory = diff(&source_files, &target_files);
    write_response(json!({
        "to_send": inventory.to_send(),
        "already_present": inventory.already_present(),
        "bytes_to_send": inventory.bytes_to_send(),
        "bytes_reused": inventory.bytes_reused(),
    }))
}

/// `recover`: run one local recovery and print both sides' final state
pub fn recover(
    source_dir: &Path,
    target_dir: &Path,
    settings: RecoverySettings,
    shard_id: ShardId,
) -> CliResult<()> {
    let report = run_local_recovery(source_dir, target_dir, settings, shard_id)?;
    let data = serde_json::to_value(&report)?;
    match &report.error {
        None => write_response(data),
        Some(message) => {
            let err = CliError::recovery_failed(message.clone());
            write_error(err.code_str(), err.message(), Some(data))?;
            Err(err)
        }
    }
}

/// Outcome of a local recovery
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub recovery_id: i64,
    pub shard: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_checkpoint: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub source: RecoveryStateSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<RecoveryStateSnapshot>,
    pub metrics: MetricsSnapshot,
}

/// Recover `target_dir` from `source_dir` through the in-process transport.
///
/// A failed recovery is still a report; only setup problems are errors.
pub fn run_local_recovery(
    source_dir: &Path,
    target_dir: &Path,
    settings: RecoverySettings,
    shard_id: ShardId,
) -> CliResult<RecoveryReport> {
    settings.validate()?;
    let source = RecoverySource::new(
        ShardStore::open(source_dir.join(INDEX_DIR))?,
        Translog::open_in_shard(source_dir)?,
    );
    let target_store = ShardStore::open(target_dir.join(INDEX_DIR))?;
    let segments =
        load_segments(&target_store).map_err(|e| CliError::store_error(e.to_string()))?;
    let engine = InMemoryEngine::with_segments(segments)?;

    let metrics = Arc::new(MetricsRegistry::new());
    let service = Arc::new(RecoveryTargetService::new(
        NodeId::generate("target"),
        Arc::clone(&metrics),
    ));
    service.register_shard(shard_id.clone(), target_store, Box::new(engine));
    let start = service.start_recovery(&shard_id, NodeId::generate("source"))?;
    let recovery_id = start.recovery_id;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::io_error(format!("failed to start runtime: {}", e)))?;
    let manager = RecoveryManager::new(settings, Arc::clone(&metrics));
    let (result, source_state) = runtime.block_on(async {
        let transport = Arc::new(LocalTransport::new(Arc::clone(&service)));
        let handle = manager.start_recovery(start, source, transport);
        let state = handle.state();
        (handle.wait().await, state)
    });

    let (local_checkpoint, error) = match result {
        Ok(checkpoint) => (Some(checkpoint), None),
        Err(err) => (None, Some(err.to_string())),
    };
    Ok(RecoveryReport {
        recovery_id,
        shard: shard_id.to_string(),
        local_checkpoint,
        error,
        source: source_state.snapshot(),
        target: service.state(recovery_id).map(|s| s.snapshot()),
        metrics: metrics.snapshot(),
    })
}
