//! Recovery source: drives one session from the node holding the good copy
//!
//! The source pins its file snapshot and captures the translog range before
//! sending anything, so the files and operations it streams describe one
//! consistent point. Chunks flow with a bounded number unacknowledged;
//! operation batches go one at a time, each waiting for its ack. Every
//! outstanding send races the session's cancellation token.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};

use super::config::RecoverySettings;
use super::errors::{RecoveryError, RecoveryResult};
use super::inventory::{diff, FileInventory};
use super::messages::{
    CancelRequest, FileChunkRequest, FilesCompleteRequest, FilesInfoRequest, FinalizeRequest,
    RecoveryRequest, RecoveryResponse, StartRecoveryRequest, TranslogOpsRequest,
};
use super::session::RecoverySession;
use super::state::RecoveryPhase;
use super::transport::RecoveryTransport;
use crate::observability::{MetricsRegistry, ObservationScope};
use crate::store::checksum::compute_checksum;
use crate::store::{FileMetadata, ShardStore, StoreSnapshot};
use crate::translog::{Translog, TranslogOperation, TranslogSnapshot};

/// An acknowledged chunk: bytes carried and whether it closed its file.
type ChunkFuture<'a> = BoxFuture<'a, RecoveryResult<(u64, bool)>>;

/// Source-side shard: its store and its operation history.
#[derive(Clone)]
pub struct RecoverySource {
    pub store: ShardStore,
    pub translog: Arc<Mutex<Translog>>,
}

impl RecoverySource {
    pub fn new(store: ShardStore, translog: Translog) -> Self {
        Self {
            store,
            translog: Arc::new(Mutex::new(translog)),
        }
    }
}

/// Drives one session against a target.
pub struct RecoverySourceHandler {
    session: Arc<RecoverySession>,
    source: RecoverySource,
    transport: Arc<dyn RecoveryTransport>,
    settings: RecoverySettings,
    metrics: Arc<MetricsRegistry>,
}

impl RecoverySourceHandler {
    pub fn new(
        session: Arc<RecoverySession>,
        source: RecoverySource,
        transport: Arc<dyn RecoveryTransport>,
        settings: RecoverySettings,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            session,
            source,
            transport,
            settings,
            metrics,
        }
    }

    /// Run the session to DONE and return the target's local checkpoint.
    ///
    /// The source's file snapshot stays pinned for the whole session. On
    /// failure the session moves to FAILED and the target is told to cancel;
    /// the pin is released once the target acknowledges or the cancel grace
    /// period elapses.
    pub async fn run(&self, start: &StartRecoveryRequest) -> RecoveryResult<i64> {
        let snapshot = self.source.store.snapshot();
        let result = match &snapshot {
            Ok(snapshot) => self.recover(start, snapshot).await,
            Err(err) => Err(RecoveryError::from(err.clone())),
        };
        let outcome = match result {
            Ok(checkpoint) => Ok(checkpoint),
            Err(err) => {
                let state = self.session.state();
                let err = err
                    .with_context(self.session.recovery_id(), self.session.shard_id())
                    .in_phase(state.phase());
                state.fail(err.to_string(), err.is_cancellation());
                self.notify_target_cancelled(err.message()).await;
                Err(err)
            }
        };
        drop(snapshot);
        outcome
    }

    async fn recover(&self, start: &StartRecoveryRequest, snapshot: &StoreSnapshot) -> RecoveryResult<i64> {
        self.session.cancel_token().check()?;

        let operations = self.capture_operations(start.starting_seq_no);
        let total_ops = u32::try_from(operations.total_operations()).map_err(|_| {
            RecoveryError::protocol(format!(
                "{} operations exceed one recovery",
                operations.total_operations()
            ))
        })?;
        let global_checkpoint = operations
            .to_seq_no()
            .max(start.starting_seq_no - 1);

        let inventory = diff(snapshot.files(), &start.metadata_snapshot);
        self.send_files(&inventory, total_ops).await?;
        self.send_operations(start.starting_seq_no, total_ops, operations)
            .await?;
        self.finalize(global_checkpoint).await
    }

    fn capture_operations(&self, starting_seq_no: i64) -> TranslogSnapshot {
        let translog = self
            .source
            .translog
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        translog.snapshot(starting_seq_no, translog.max_seq_no())
    }

    fn scope(&self, name: &'static str) -> ObservationScope {
        ObservationScope::with_fields(name, &self.session.log_fields())
    }

    /// Send `request` unless the session is cancelled first.
    async fn send(&self, request: RecoveryRequest, long: bool) -> RecoveryResult<RecoveryResponse> {
        let timeout = if long {
            self.settings.internal_action_long_timeout()
        } else {
            self.settings.internal_action_timeout()
        };
        let token = self.session.cancel_token();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(self.cancelled_error()),
            reply = self.transport.send(request, timeout) => reply,
        }
    }

    fn cancelled_error(&self) -> RecoveryError {
        let reason = self
            .session
            .cancel_token()
            .reason()
            .unwrap_or_else(|| "cancelled".to_string());
        RecoveryError::cancelled(reason)
    }

    async fn send_files(&self, inventory: &FileInventory, total_ops: u32) -> RecoveryResult<()> {
        let state = self.session.state();
        state.transition(RecoveryPhase::Files)?;
        let scope = self.scope("RECOVERY_FILES");

        state.set_file_totals(
            inventory.total_files() as u64,
            inventory.already_present().len() as u64,
            inventory.total_bytes(),
            inventory.bytes_reused(),
        );
        state.set_ops_total(u64::from(total_ops));
        self.metrics
            .add_files_reused(inventory.already_present().len() as u64);

        let info = FilesInfoRequest {
            request_seq_no: self.session.next_request_seq_no(),
            recovery_id: self.session.recovery_id(),
            shard_id: self.session.shard_id().clone(),
            phase1_file_names: inventory.phase1_file_names(),
            phase1_file_sizes: inventory.phase1_file_sizes(),
            phase1_existing_file_names: inventory.phase1_existing_file_names(),
            phase1_existing_file_sizes: inventory.phase1_existing_file_sizes(),
            total_translog_ops: total_ops,
        };
        let result = async {
            expect_ack(self.send(RecoveryRequest::FilesInfo(info), false).await?)?;
            self.send_chunks(inventory.to_send(), total_ops).await?;

            let complete = FilesCompleteRequest {
                request_seq_no: self.session.next_request_seq_no(),
                recovery_id: self.session.recovery_id(),
                shard_id: self.session.shard_id().clone(),
                start_seq_no: self.session.starting_seq_no(),
                total_translog_ops: total_ops,
            };
            expect_ack(self.send(RecoveryRequest::FilesComplete(complete), false).await?)
        }
        .await;

        match result {
            Ok(()) => {
                let sent = inventory.to_send().len().to_string();
                let reused = inventory.already_present().len().to_string();
                let bytes = inventory.bytes_to_send().to_string();
                scope.complete_with_fields(&[
                    ("files_sent", &sent),
                    ("files_reused", &reused),
                    ("bytes_sent", &bytes),
                ]);
                Ok(())
            }
            Err(err) => {
                scope.fail(&err.to_string());
                Err(err)
            }
        }
    }

    /// Stream every file in order, keeping at most
    /// `max_concurrent_file_chunks` chunks unacknowledged.
    async fn send_chunks(&self, files: &[FileMetadata], total_ops: u32) -> RecoveryResult<()> {
        let window = self.settings.max_concurrent_file_chunks.max(1);
        let chunk_size = self.settings.chunk_size_bytes.max(1) as u64;
        let mut in_flight: FuturesUnordered<ChunkFuture<'_>> = FuturesUnordered::new();

        for file in files {
            let mut position = 0u64;
            loop {
                self.session.cancel_token().check()?;
                let len = chunk_size.min(file.length - position);
                let content = self.source.store.read_chunk(&file.name, position, len as usize)?;
                let last_chunk = position + len == file.length;
                let request = FileChunkRequest {
                    request_seq_no: self.session.next_request_seq_no(),
                    recovery_id: self.session.recovery_id(),
                    shard_id: self.session.shard_id().clone(),
                    metadata: file.clone(),
                    position,
                    chunk_checksum: compute_checksum(&content),
                    content,
                    last_chunk,
                    total_translog_ops: total_ops,
                };

                while in_flight.len() >= window {
                    self.await_chunk(&mut in_flight).await?;
                }
                let expected_position = position;
                in_flight.push(Box::pin(async move {
                    match self.send(RecoveryRequest::FileChunk(request), false).await? {
                        RecoveryResponse::ChunkAck { position } if position == expected_position => {
                            Ok((len, last_chunk))
                        }
                        other => Err(unexpected_reply("file chunk", &other)),
                    }
                }));

                position += len;
                if last_chunk {
                    break;
                }
            }
        }

        while !in_flight.is_empty() {
            self.await_chunk(&mut in_flight).await?;
        }
        Ok(())
    }

    async fn await_chunk(&self, in_flight: &mut FuturesUnordered<ChunkFuture<'_>>) -> RecoveryResult<()> {
        match in_flight.next().await {
            Some(Ok((bytes, closed_file))) => {
                let state = self.session.state();
                state.add_bytes_transferred(bytes);
                self.metrics.add_bytes_sent(bytes);
                if closed_file {
                    state.add_file_sent();
                    self.metrics.add_files_sent(1);
                }
                Ok(())
            }
            Some(Err(err)) => Err(err),
            None => Ok(()),
        }
    }

    /// Replay the captured range in sequence order, in batches bounded by
    /// count and encoded size.
    async fn send_operations(
        &self,
        starting_seq_no: i64,
        total_ops: u32,
        operations: TranslogSnapshot,
    ) -> RecoveryResult<()> {
        let state = self.session.state();
        state.transition(RecoveryPhase::Ops)?;
        let scope = self.scope("RECOVERY_OPS");

        let result = async {
            let mut expected = starting_seq_no;
            let mut batch: Vec<TranslogOperation> = Vec::new();
            let mut batch_bytes = 0usize;
            for op in operations {
                if op.seq_no != expected {
                    return Err(RecoveryError::sequence_gap(expected, op.seq_no));
                }
                expected += 1;

                let size = op.estimated_size();
                let full = batch.len() >= self.settings.ops_batch_size
                    || batch_bytes + size > self.settings.ops_batch_bytes;
                if !batch.is_empty() && full {
                    self.send_batch(std::mem::take(&mut batch), total_ops).await?;
                    batch_bytes = 0;
                }
                batch_bytes += size;
                batch.push(op);
            }
            if !batch.is_empty() {
                self.send_batch(batch, total_ops).await?;
            }
            Ok::<(), RecoveryError>(())
        }
        .await;

        match result {
            Ok(()) => {
                let ops = state.ops_recovered().to_string();
                scope.complete_with_fields(&[("ops", &ops)]);
                Ok(())
            }
            Err(err) => {
                scope.fail(&err.to_string());
                Err(err)
            }
        }
    }

    async fn send_batch(&self, operations: Vec<TranslogOperation>, total_ops: u32) -> RecoveryResult<()> {
        self.session.cancel_token().check()?;
        let count = operations.len() as u64;
        let last_seq_no = operations.last().map(|op| op.seq_no).unwrap_or(-1);
        let request = TranslogOpsRequest {
            request_seq_no: self.session.next_request_seq_no(),
            recovery_id: self.session.recovery_id(),
            shard_id: self.session.shard_id().clone(),
            operations,
            total_translog_ops: total_ops,
        };
        match self.send(RecoveryRequest::TranslogOps(request), false).await? {
            RecoveryResponse::OpsAck { local_checkpoint } if local_checkpoint >= last_seq_no => {
                self.session.state().add_ops_recovered(count);
                Ok(())
            }
            RecoveryResponse::OpsAck { local_checkpoint } => Err(RecoveryError::protocol(format!(
                "target checkpoint {} behind acknowledged batch ending at {}",
                local_checkpoint, last_seq_no
            ))),
            other => Err(unexpected_reply("translog ops", &other)),
        }
    }

    async fn finalize(&self, global_checkpoint: i64) -> RecoveryResult<i64> {
        let state = self.session.state();
        state.transition(RecoveryPhase::Finalize)?;
        let scope = self.scope("RECOVERY_FINALIZE");

        let request = FinalizeRequest {
            request_seq_no: self.session.next_request_seq_no(),
            recovery_id: self.session.recovery_id(),
            shard_id: self.session.shard_id().clone(),
            global_checkpoint,
        };
        let result = match self.send(RecoveryRequest::Finalize(request), true).await {
            Ok(RecoveryResponse::FinalizeAck { local_checkpoint }) => Ok(local_checkpoint),
            Ok(other) => Err(unexpected_reply("finalize", &other)),
            Err(err) => Err(err),
        };

        match result {
            Ok(local_checkpoint) => {
                state.transition(RecoveryPhase::Done)?;
                let checkpoint = local_checkpoint.to_string();
                scope.complete_with_fields(&[("local_checkpoint", &checkpoint)]);
                Ok(local_checkpoint)
            }
            Err(err) => {
                scope.fail(&err.to_string());
                Err(err)
            }
        }
    }

    /// Best-effort cancel on the target, bounded by the cancel grace period.
    pub(crate) async fn notify_target_cancelled(&self, reason: &str) {
        let request = RecoveryRequest::Cancel(CancelRequest {
            recovery_id: self.session.recovery_id(),
            shard_id: self.session.shard_id().clone(),
            reason: reason.to_string(),
        });
        // The target acks cancels for recoveries that already ended.
        let _ = self
            .transport
            .send(request, self.settings.cancel_grace())
            .await;
    }
}

fn expect_ack(reply: RecoveryResponse) -> RecoveryResult<()> {
    match reply {
        RecoveryResponse::Ack => Ok(()),
        other => Err(unexpected_reply("ack", &other)),
    }
}

fn unexpected_reply(expected: &str, reply: &RecoveryResponse) -> RecoveryError {
    RecoveryError::protocol(format!("expected {} reply, got {:?}", expected, reply))
}
