//! Recovery target: the receiving side of one recovery
//!
//! Incoming files are staged under `recovery.<recovery_id>.<name>` and only
//! renamed to their live names at finalize, after every operation has been
//! replayed. Any failure deletes the staged files and moves the target to
//! FAILED; later requests for it are rejected.
//!
//! Operations must arrive in sequence order. An operation below the next
//! expected sequence number is a redelivery and is ignored without being
//! counted again; one above it is a gap and fails the recovery. An
//! operation the local copy already holds with an equal or newer sequence
//! number is counted as skipped and not applied.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use super::errors::{RecoveryError, RecoveryResult};
use super::messages::{
    FileChunkRequest, FilesCompleteRequest, FilesInfoRequest, FinalizeRequest, RecoveryRequest,
    RecoveryResponse, TranslogOpsRequest,
};
use super::state::{RecoveryPhase, RecoveryState};
use crate::engine::StorageEngine;
use crate::observability::{Event, Logger, MetricsRegistry};
use crate::shard::ShardId;
use crate::store::checksum::compute_checksum;
use crate::store::{FileMetadata, ShardStore};
use crate::translog::TranslogOperation;
use crate::uid::{IdResolver, Segment, SEGMENT_FILE_EXTENSION};

/// Engine shared by successive recoveries of one shard.
pub type SharedEngine = Arc<Mutex<Box<dyn StorageEngine>>>;

fn is_segment_file(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| ext == SEGMENT_FILE_EXTENSION)
        .unwrap_or(false)
}

/// Decode every live segment file of `store`, oldest generation first.
pub fn load_segments(store: &ShardStore) -> RecoveryResult<Vec<Arc<Segment>>> {
    let mut segments = Vec::new();
    for file in store.list_metadata()? {
        if is_segment_file(&file.name) {
            let bytes = store.read_file(&file.name)?;
            segments.push(Arc::new(Segment::decode(&bytes)?));
        }
    }
    segments.sort_by_key(|s| s.generation());
    Ok(segments)
}

/// Sum of announced sizes, rejecting totals that do not fit in a u64.
fn total_size(what: &str, sizes: &[u64]) -> RecoveryResult<u64> {
    sizes
        .iter()
        .try_fold(0u64, |total, size| total.checked_add(*size))
        .ok_or_else(|| RecoveryError::protocol(format!("{} overflow a u64", what)))
}

/// A file announced for transfer.
#[derive(Debug)]
struct IncomingFile {
    temp_name: String,
    length: u64,
    /// Full metadata, learned from the first chunk.
    metadata: Option<FileMetadata>,
    /// position → length of every distinct chunk written
    chunks: BTreeMap<u64, u64>,
    received: u64,
    verified: bool,
}

/// Receiver for one recovery attempt.
pub struct RecoveryTarget {
    recovery_id: i64,
    shard_id: ShardId,
    store: ShardStore,
    engine: SharedEngine,
    state: Arc<RecoveryState>,
    metrics: Arc<MetricsRegistry>,
    resolver: IdResolver,
    incoming: BTreeMap<String, IncomingFile>,
    existing: Vec<String>,
    total_translog_ops: u32,
    next_seq_no: i64,
    ops_recovered: u64,
    global_checkpoint: Option<i64>,
    /// Engine holds staged, unpromoted segments.
    engine_staged: bool,
}

impl RecoveryTarget {
    pub fn new(
        recovery_id: i64,
        shard_id: ShardId,
        store: ShardStore,
        engine: SharedEngine,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            recovery_id,
            shard_id,
            store,
            engine,
            state: Arc::new(RecoveryState::new()),
            metrics,
            resolver: IdResolver::new(),
            incoming: BTreeMap::new(),
            existing: Vec::new(),
            total_translog_ops: 0,
            next_seq_no: 0,
            ops_recovered: 0,
            global_checkpoint: None,
            engine_staged: false,
        }
    }

    pub fn recovery_id(&self) -> i64 {
        self.recovery_id
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn state(&self) -> &Arc<RecoveryState> {
        &self.state
    }

    /// Highest sequence number below which every operation is replayed.
    pub fn local_checkpoint(&self) -> i64 {
        self.next_seq_no - 1
    }

    pub fn global_checkpoint(&self) -> Option<i64> {
        self.global_checkpoint
    }

    fn id_fields(&self) -> [(&'static str, String); 2] {
        [
            ("recovery_id", self.recovery_id.to_string()),
            ("shard", self.shard_id.to_string()),
        ]
    }

    fn log(&self, event: Event, extra: &[(&str, &str)]) {
        let ids = self.id_fields();
        let mut fields: Vec<(&str, &str)> = ids.iter().map(|(k, v)| (*k, v.as_str())).collect();
        fields.extend_from_slice(extra);
        Logger::event(event, &fields);
    }

    /// Dispatch one request. Errors fail the recovery and come back as a
    /// failure response.
    pub fn handle(&mut self, request: RecoveryRequest) -> RecoveryResponse {
        if let RecoveryRequest::Cancel(cancel) = &request {
            self.cancel(&cancel.reason);
            return RecoveryResponse::Ack;
        }

        if self.state.is_terminal() {
            let err = RecoveryError::protocol(format!(
                "recovery is already {}",
                self.state.phase()
            ))
            .with_context(self.recovery_id, &self.shard_id)
            .in_phase(self.state.phase());
            return RecoveryResponse::failure(&err);
        }

        let result = match request {
            RecoveryRequest::FilesInfo(r) => self.on_file_inventory(&r),
            RecoveryRequest::FileChunk(r) => self.on_file_chunk(&r),
            RecoveryRequest::FilesComplete(r) => self.on_files_complete(&r),
            RecoveryRequest::TranslogOps(r) => self.on_operation_batch(&r),
            RecoveryRequest::Finalize(r) => self.on_finalize(&r),
            RecoveryRequest::Cancel(_) => Ok(RecoveryResponse::Ack),
        };

        match result {
            Ok(response) => response,
            Err(err) => {
                let err = err
                    .with_context(self.recovery_id, &self.shard_id)
                    .in_phase(self.state.phase());
                self.fail(&err);
                RecoveryResponse::failure(&err)
            }
        }
    }

    /// Record the inventory and stage a temp file for every file to receive.
    pub fn on_file_inventory(&mut self, msg: &FilesInfoRequest) -> RecoveryResult<RecoveryResponse> {
        self.state.expect_phase(RecoveryPhase::Init)?;
        if msg.phase1_file_names.len() != msg.phase1_file_sizes.len() {
            return Err(RecoveryError::protocol(format!(
                "{} file names but {} file sizes",
                msg.phase1_file_names.len(),
                msg.phase1_file_sizes.len()
            )));
        }
        if msg.phase1_existing_file_names.len() != msg.phase1_existing_file_sizes.len() {
            return Err(RecoveryError::protocol(format!(
                "{} existing file names but {} existing file sizes",
                msg.phase1_existing_file_names.len(),
                msg.phase1_existing_file_sizes.len()
            )));
        }

        let mut seen = HashSet::new();
        for name in msg
            .phase1_file_names
            .iter()
            .chain(msg.phase1_existing_file_names.iter())
        {
            if ShardStore::is_temp_file(name) || !seen.insert(name.as_str()) {
                return Err(RecoveryError::protocol(format!(
                    "file [{}] announced twice or reserved",
                    name
                )));
            }
        }

        let held: HashMap<String, u64> = self
            .store
            .list_metadata()?
            .into_iter()
            .map(|f| (f.name, f.length))
            .collect();
        for (name, size) in msg
            .phase1_existing_file_names
            .iter()
            .zip(&msg.phase1_existing_file_sizes)
        {
            match held.get(name) {
                None => {
                    return Err(RecoveryError::protocol(format!(
                        "file [{}] announced as present is missing",
                        name
                    )));
                }
                Some(length) if length != size => {
                    return Err(RecoveryError::protocol(format!(
                        "file [{}] announced as present with {} bytes but holds {}",
                        name, size, length
                    )));
                }
                Some(_) => {}
            }
        }

        let bytes_to_receive = total_size("file sizes", &msg.phase1_file_sizes)?;
        let bytes_reused = total_size("existing file sizes", &msg.phase1_existing_file_sizes)?;
        let bytes_total = bytes_to_receive
            .checked_add(bytes_reused)
            .ok_or_else(|| RecoveryError::protocol("file sizes overflow a u64"))?;

        for (name, size) in msg.phase1_file_names.iter().zip(&msg.phase1_file_sizes) {
            let temp_name = ShardStore::temp_file_name(self.recovery_id, name);
            self.store.create_sized(&temp_name, *size)?;
            self.incoming.insert(
                name.clone(),
                IncomingFile {
                    temp_name,
                    length: *size,
                    metadata: None,
                    chunks: BTreeMap::new(),
                    received: 0,
                    verified: false,
                },
            );
        }
        self.existing = msg.phase1_existing_file_names.clone();
        self.total_translog_ops = msg.total_translog_ops;

        self.state.set_file_totals(
            (msg.phase1_file_names.len() + msg.phase1_existing_file_names.len()) as u64,
            msg.phase1_existing_file_names.len() as u64,
            bytes_total,
            bytes_reused,
        );
        self.state.set_ops_total(u64::from(msg.total_translog_ops));
        self.state.transition(RecoveryPhase::Files)?;

        let files = msg.phase1_file_names.len().to_string();
        let reused = msg.phase1_existing_file_names.len().to_string();
        self.log(Event::FilesBegin, &[("files", &files), ("reused", &reused)]);
        Ok(RecoveryResponse::Ack)
    }

    /// Write one chunk at its position; verify the file once complete.
    pub fn on_file_chunk(&mut self, chunk: &FileChunkRequest) -> RecoveryResult<RecoveryResponse> {
        self.state.expect_phase(RecoveryPhase::Files)?;
        let name = chunk.metadata.name.clone();
        let len = chunk.content.len() as u64;
        let (temp_name, already_written) = {
            let file = self.incoming.get_mut(&name).ok_or_else(|| {
                RecoveryError::protocol(format!("unexpected file [{}]", name))
            })?;
            if file.verified {
                return Ok(RecoveryResponse::ChunkAck {
                    position: chunk.position,
                });
            }
            if chunk.metadata.length != file.length {
                return Err(RecoveryError::protocol(format!(
                    "file [{}] announced with length {} but chunk says {}",
                    name, file.length, chunk.metadata.length
                )));
            }
            match &file.metadata {
                Some(known) if known != &chunk.metadata => {
                    return Err(RecoveryError::protocol(format!(
                        "file [{}] metadata changed between chunks",
                        name
                    )));
                }
                Some(_) => {}
                None => file.metadata = Some(chunk.metadata.clone()),
            }
            match chunk.position.checked_add(len) {
                Some(end) if end <= file.length => {}
                _ => {
                    return Err(RecoveryError::protocol(format!(
                        "chunk of {} bytes at {} of [{}] exceeds length {}",
                        len, chunk.position, name, file.length
                    )));
                }
            }
            (file.temp_name.clone(), file.chunks.contains_key(&chunk.position))
        };

        let actual = compute_checksum(&chunk.content);
        if actual != chunk.chunk_checksum {
            self.metrics.increment_chunk_mismatches();
            let expected = format!("{:08x}", chunk.chunk_checksum);
            let actual = format!("{:08x}", actual);
            let position = chunk.position.to_string();
            self.log(
                Event::ChunkMismatch,
                &[
                    ("file", &name),
                    ("position", &position),
                    ("expected", &expected),
                    ("actual", &actual),
                ],
            );
            self.discard_incoming(&name);
            return Err(RecoveryError::checksum_mismatch(format!(
                "chunk at position {} of [{}]: expected {}, actual {}",
                position, name, expected, actual
            )));
        }

        if !already_written {
            self.store.write_at(&temp_name, chunk.position, &chunk.content)?;
            if let Some(file) = self.incoming.get_mut(&name) {
                file.chunks.insert(chunk.position, len);
                file.received = file.received.saturating_add(len);
            }
        }

        let complete = self
            .incoming
            .get(&name)
            .map(|f| f.received == f.length && !f.chunks.is_empty())
            .unwrap_or(false);
        if complete {
            if let Err(err) = self.store.verify(&temp_name, &chunk.metadata) {
                self.metrics.increment_chunk_mismatches();
                self.log(Event::ChunkMismatch, &[("file", &name), ("reason", &err.to_string())]);
                self.discard_incoming(&name);
                return Err(err.into());
            }
            if let Some(file) = self.incoming.get_mut(&name) {
                file.verified = true;
            }
            self.state.add_file_sent();
            self.log(Event::FileVerified, &[("file", &name)]);
        }

        Ok(RecoveryResponse::ChunkAck {
            position: chunk.position,
        })
    }

    fn discard_incoming(&mut self, name: &str) {
        if let Some(file) = self.incoming.get(name) {
            if let Err(err) = self.store.delete(&file.temp_name) {
                Logger::warn(
                    "RECOVERY_TEMP_CLEANUP_FAILED",
                    &[("file", &file.temp_name), ("reason", &err.to_string())],
                );
            }
        }
    }

    /// Every announced file is verified: hand the staged segments to the
    /// engine and move to OPS.
    pub fn on_files_complete(&mut self, msg: &FilesCompleteRequest) -> RecoveryResult<RecoveryResponse> {
        self.state.expect_phase(RecoveryPhase::Files)?;
        if let Some((name, _)) = self.incoming.iter().find(|(_, f)| !f.verified) {
            return Err(RecoveryError::protocol(format!(
                "files complete but [{}] was not fully received",
                name
            )));
        }
        if msg.total_translog_ops != self.total_translog_ops {
            return Err(RecoveryError::protocol(format!(
                "total operations changed from {} to {}",
                self.total_translog_ops, msg.total_translog_ops
            )));
        }

        let mut segments = Vec::new();
        let staged = self
            .incoming
            .iter()
            .map(|(name, f)| (name.as_str(), f.temp_name.as_str()))
            .chain(self.existing.iter().map(|n| (n.as_str(), n.as_str())));
        for (name, stored_as) in staged {
            if !is_segment_file(name) {
                continue;
            }
            let bytes = self.store.read_file(stored_as)?;
            let segment = Segment::decode(&bytes).map_err(|e| {
                self.log(Event::InconsistentSegment, &[("file", name), ("reason", &e.to_string())]);
                RecoveryError::from(e)
            })?;
            segments.push(Arc::new(segment));
        }
        segments.sort_by_key(|s| s.generation());

        {
            let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
            engine.prepare_for_operations(segments)?;
        }
        self.engine_staged = true;
        self.resolver = IdResolver::new();
        self.next_seq_no = msg.start_seq_no;
        self.state.transition(RecoveryPhase::Ops)?;

        let start = msg.start_seq_no.to_string();
        let total = msg.total_translog_ops.to_string();
        self.log(Event::FilesComplete, &[]);
        self.log(Event::OpsBegin, &[("start_seq_no", &start), ("total_ops", &total)]);
        Ok(RecoveryResponse::Ack)
    }

    /// Replay one batch, in order, exactly once per sequence number.
    pub fn on_operation_batch(&mut self, batch: &TranslogOpsRequest) -> RecoveryResult<RecoveryResponse> {
        self.state.expect_phase(RecoveryPhase::Ops)?;
        if batch.total_translog_ops != self.total_translog_ops {
            return Err(RecoveryError::protocol(format!(
                "total operations changed from {} to {}",
                self.total_translog_ops, batch.total_translog_ops
            )));
        }

        let engine = Arc::clone(&self.engine);
        let mut engine = engine.lock().unwrap_or_else(PoisonError::into_inner);
        let segments = engine.searcher();
        let mut applied = 0u64;
        let mut skipped = 0u64;

        for op in &batch.operations {
            if op.seq_no < self.next_seq_no {
                continue;
            }
            if op.seq_no > self.next_seq_no {
                return Err(RecoveryError::sequence_gap(self.next_seq_no, op.seq_no));
            }
            if self.ops_recovered >= u64::from(self.total_translog_ops) {
                return Err(RecoveryError::protocol(format!(
                    "operation {} exceeds the announced total of {}",
                    op.seq_no, self.total_translog_ops
                )));
            }

            if self.already_held(&**engine, &segments, op)? {
                skipped += 1;
            } else {
                engine.apply_operation(op)?;
                applied += 1;
            }
            self.next_seq_no += 1;
            self.ops_recovered += 1;
        }
        engine.refresh()?;
        drop(engine);

        self.state.add_ops_recovered(applied + skipped);
        self.state.add_ops_skipped(skipped);
        self.metrics.add_ops_replayed(applied);
        self.metrics.add_ops_skipped(skipped);

        let checkpoint = self.local_checkpoint().to_string();
        let applied_s = applied.to_string();
        let skipped_s = skipped.to_string();
        self.log(
            Event::OpsBatch,
            &[
                ("applied", &applied_s),
                ("skipped", &skipped_s),
                ("local_checkpoint", &checkpoint),
            ],
        );
        Ok(RecoveryResponse::OpsAck {
            local_checkpoint: self.local_checkpoint(),
        })
    }

    /// Whether the local copy already reflects `op`.
    ///
    /// A sequence number the engine has processed is held whatever the
    /// operation kind; its position may since have been deleted or may be a
    /// tombstone. Otherwise an operation with an id is held when the live
    /// copy of that id is at least as new.
    fn already_held(
        &mut self,
        engine: &dyn StorageEngine,
        segments: &[Arc<Segment>],
        op: &TranslogOperation,
    ) -> RecoveryResult<bool> {
        if engine.has_processed(op.seq_no) {
            return Ok(true);
        }
        match op.id() {
            Some(id) => Ok(self
                .resolver
                .load_doc_id_and_seq_no(segments, id.as_bytes())?
                .map(|found| found.seq_no >= op.seq_no)
                .unwrap_or(false)),
            None => Ok(false),
        }
    }

    /// Promote staged files and finish the recovery.
    pub fn on_finalize(&mut self, msg: &FinalizeRequest) -> RecoveryResult<RecoveryResponse> {
        self.state.expect_phase(RecoveryPhase::Ops)?;
        if self.ops_recovered != u64::from(self.total_translog_ops) {
            return Err(RecoveryError::protocol(format!(
                "finalize after {} of {} operations",
                self.ops_recovered, self.total_translog_ops
            )));
        }
        self.state.transition(RecoveryPhase::Finalize)?;
        self.log(Event::FinalizeBegin, &[]);

        for file in self.incoming.values() {
            self.store.fsync(&file.temp_name)?;
        }
        for (name, file) in &self.incoming {
            self.store.rename(&file.temp_name, name)?;
        }
        self.store.sync_directory()?;

        let keep: HashSet<String> = self
            .incoming
            .keys()
            .cloned()
            .chain(self.existing.iter().cloned())
            .collect();
        let removed = self.store.cleanup_except(&keep)?;
        self.global_checkpoint = Some(msg.global_checkpoint);
        self.state.transition(RecoveryPhase::Done)?;

        let checkpoint = self.local_checkpoint().to_string();
        let global = msg.global_checkpoint.to_string();
        let removed = removed.len().to_string();
        self.log(
            Event::FinalizeComplete,
            &[
                ("local_checkpoint", &checkpoint),
                ("global_checkpoint", &global),
                ("stale_files_removed", &removed),
            ],
        );
        Ok(RecoveryResponse::FinalizeAck {
            local_checkpoint: self.local_checkpoint(),
        })
    }

    /// Abort, drop staged files, FAILED with the cancelled flag. No-op once
    /// terminal.
    pub fn cancel(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        self.remove_temp_files();
        self.restore_engine();
        if self.state.fail(reason, true) {
            self.log(Event::RecoveryCancelled, &[("reason", reason)]);
        }
    }

    fn fail(&mut self, err: &RecoveryError) {
        self.remove_temp_files();
        self.restore_engine();
        if self.state.fail(err.to_string(), err.is_cancellation()) {
            let event = if err.is_fatal() {
                Event::InconsistentSegment
            } else if err.is_cancellation() {
                Event::RecoveryCancelled
            } else {
                Event::RecoveryFailed
            };
            self.log(event, &[("code", err.kind().code()), ("reason", err.message())]);
        }
    }

    /// Point the engine back at the live files after an abandoned OPS phase.
    fn restore_engine(&mut self) {
        if !self.engine_staged {
            return;
        }
        self.engine_staged = false;
        let restored = load_segments(&self.store).and_then(|segments| {
            let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
            engine.prepare_for_operations(segments).map_err(RecoveryError::from)
        });
        if let Err(err) = restored {
            Logger::warn(
                "RECOVERY_ENGINE_RESTORE_FAILED",
                &[
                    ("recovery_id", &self.recovery_id.to_string()),
                    ("reason", &err.to_string()),
                ],
            );
        }
    }

    fn remove_temp_files(&self) {
        if let Err(err) = self.store.remove_temp_files(self.recovery_id) {
            Logger::warn(
                "RECOVERY_TEMP_CLEANUP_FAILED",
                &[
                    ("recovery_id", &self.recovery_id.to_string()),
                    ("reason", &err.to_string()),
                ],
            );
        }
    }
}
