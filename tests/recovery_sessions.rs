//! Peer Recovery Session Tests
//!
//! End-to-end sessions through the manager, the in-process transport and the
//! target service:
//! - Incremental file transfer reuses identical files
//! - Operations are applied exactly once, in order
//! - Checksum mismatches, timeouts and cancellation leave no staged files
//! - The per-node concurrency limit serialises FILES phases

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use peerrecovery::engine::{EngineResult, InMemoryEngine, StorageEngine};
use peerrecovery::observability::MetricsRegistry;
use peerrecovery::recovery::{
    LocalTransport, RecoveryErrorKind, RecoveryManager, RecoveryPhase, RecoveryRequest,
    RecoveryResponse, RecoveryResult, RecoverySettings, RecoverySource, RecoveryTargetService,
    RecoveryTransport,
};
use peerrecovery::shard::{IndexId, NodeId, ShardId};
use peerrecovery::store::ShardStore;
use peerrecovery::translog::{Translog, TranslogOperation};
use peerrecovery::uid::{Segment, SegmentBuilder, SegmentGeneration};
use tempfile::TempDir;

// =============================================================================
// Test Utilities
// =============================================================================

fn shard(n: u32) -> ShardId {
    ShardId::new(IndexId::new("events", "idx-uuid"), n)
}

fn segment(generation: u64, docs: &[(&str, i64)]) -> Segment {
    let mut builder = SegmentBuilder::new();
    for (id, seq_no) in docs {
        builder.add_document(id.as_bytes().to_vec(), 1, *seq_no, 1);
    }
    builder.build(SegmentGeneration(generation))
}

fn translog(ops: std::ops::Range<i64>) -> Translog {
    let mut log = Translog::in_memory();
    for seq_no in ops {
        log.add(TranslogOperation::index(
            seq_no,
            1,
            format!("doc-{}", seq_no),
            1,
            format!(r#"{{"n": {}}}"#, seq_no).into_bytes(),
        ))
        .unwrap();
    }
    log
}

fn fast_settings() -> RecoverySettings {
    RecoverySettings {
        chunk_size_bytes: 16,
        max_concurrent_file_chunks: 3,
        ops_batch_size: 4,
        internal_action_timeout_ms: 10_000,
        internal_action_long_timeout_ms: 10_000,
        cancel_grace_ms: 5_000,
        ..RecoverySettings::default()
    }
}

/// Engine whose operations take `delay` each.
struct SlowEngine {
    inner: InMemoryEngine,
    delay: Duration,
}

impl StorageEngine for SlowEngine {
    fn prepare_for_operations(&mut self, segments: Vec<Arc<Segment>>) -> EngineResult<()> {
        self.inner.prepare_for_operations(segments)
    }

    fn apply_operation(&mut self, op: &TranslogOperation) -> EngineResult<i64> {
        std::thread::sleep(self.delay);
        self.inner.apply_operation(op)
    }

    fn refresh(&mut self) -> EngineResult<()> {
        self.inner.refresh()
    }

    fn searcher(&self) -> Vec<Arc<Segment>> {
        self.inner.searcher()
    }

    fn local_checkpoint(&self) -> i64 {
        self.inner.local_checkpoint()
    }

    fn max_seq_no(&self) -> i64 {
        self.inner.max_seq_no()
    }

    fn has_processed(&self, seq_no: i64) -> bool {
        self.inner.has_processed(seq_no)
    }
}

struct Node {
    _dir: TempDir,
    store: ShardStore,
}

impl Node {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ShardStore::open(dir.path()).unwrap();
        Self { _dir: dir, store }
    }
}

fn target_service(metrics: &Arc<MetricsRegistry>) -> Arc<RecoveryTargetService> {
    Arc::new(RecoveryTargetService::new(
        NodeId::generate("target-node"),
        Arc::clone(metrics),
    ))
}

/// Transport that can corrupt chunks and records what it sends.
struct TestTransport {
    inner: LocalTransport,
    corrupt_chunks: bool,
    sent: Mutex<Vec<RecoveryRequest>>,
    files_active: AtomicUsize,
    files_max: AtomicUsize,
    chunk_delay: Option<Duration>,
}

impl TestTransport {
    fn new(service: &Arc<RecoveryTargetService>) -> Self {
        Self {
            inner: LocalTransport::new(Arc::clone(service)),
            corrupt_chunks: false,
            sent: Mutex::new(Vec::new()),
            files_active: AtomicUsize::new(0),
            files_max: AtomicUsize::new(0),
            chunk_delay: None,
        }
    }

    fn sent(&self) -> Vec<RecoveryRequest> {
        self.sent.lock().unwrap().clone()
    }
}

impl RecoveryTransport for TestTransport {
    fn send(
        &self,
        mut request: RecoveryRequest,
        timeout: Duration,
    ) -> BoxFuture<'_, RecoveryResult<RecoveryResponse>> {
        Box::pin(async move {
            match &mut request {
                RecoveryRequest::FilesInfo(_) => {
                    let active = self.files_active.fetch_add(1, Ordering::SeqCst) + 1;
                    self.files_max.fetch_max(active, Ordering::SeqCst);
                }
                RecoveryRequest::FileChunk(chunk) => {
                    if let Some(delay) = self.chunk_delay {
                        tokio::time::sleep(delay).await;
                    }
                    if self.corrupt_chunks && !chunk.content.is_empty() {
                        chunk.content[0] ^= 0xFF;
                    }
                }
                _ => {}
            }
            self.sent.lock().unwrap().push(request.clone());
            let is_files_complete = matches!(request, RecoveryRequest::FilesComplete(_));
            let reply = self.inner.send(request, timeout).await;
            if is_files_complete {
                self.files_active.fetch_sub(1, Ordering::SeqCst);
            }
            reply
        })
    }
}

// =============================================================================
// Incremental file transfer
// =============================================================================

/// Source A(100), B(50); target A(100): only B is sent and 37 operations
/// are replayed before finalize.
#[tokio::test]
async fn test_incremental_recovery_sends_only_missing_files() {
    let source = Node::new();
    let target = Node::new();
    let a = vec![7u8; 100];
    let b = vec![9u8; 50];
    source.store.write_file("A", &a).unwrap();
    source.store.write_file("B", &b).unwrap();
    target.store.write_file("A", &a).unwrap();

    let metrics = Arc::new(MetricsRegistry::new());
    let service = target_service(&metrics);
    service.register_shard(shard(0), target.store.clone(), Box::new(InMemoryEngine::new()));
    let start = service.start_recovery(&shard(0), NodeId::generate("source-node")).unwrap();
    let recovery_id = start.recovery_id;

    let transport = Arc::new(TestTransport::new(&service));
    let manager = RecoveryManager::new(fast_settings(), Arc::clone(&metrics));
    let handle = manager.start_recovery(
        start,
        RecoverySource::new(source.store.clone(), translog(0..37)),
        Arc::clone(&transport) as Arc<dyn RecoveryTransport>,
    );
    let checkpoint = handle.wait().await.unwrap();
    assert_eq!(checkpoint, 36);

    let info = transport
        .sent()
        .into_iter()
        .find_map(|r| match r {
            RecoveryRequest::FilesInfo(info) => Some(info),
            _ => None,
        })
        .unwrap();
    assert_eq!(info.phase1_file_names, vec!["B".to_string()]);
    assert_eq!(info.phase1_file_sizes, vec![50]);
    assert_eq!(info.phase1_existing_file_names, vec!["A".to_string()]);
    assert_eq!(info.phase1_existing_file_sizes, vec![100]);
    assert_eq!(info.total_translog_ops, 37);

    let chunks = transport
        .sent()
        .iter()
        .filter(|r| matches!(r, RecoveryRequest::FileChunk(_)))
        .count();
    assert_eq!(chunks, 4, "50 bytes in 16 byte chunks");

    let state = service.state(recovery_id).unwrap().snapshot();
    assert_eq!(state.phase, RecoveryPhase::Done);
    assert_eq!(state.ops_recovered, 37);
    assert_eq!(state.files_reused, 1);
    assert_eq!(service.open_targets(), 0);
    assert_eq!(target.store.read_file("B").unwrap(), b);
    assert!(target.store.temp_files().unwrap().is_empty());
    assert_eq!(source.store.pinned_files(), 0);

    let counters = metrics.snapshot();
    assert_eq!(counters.recoveries_completed, 1);
    assert_eq!(counters.bytes_sent, 50);
    assert_eq!(counters.files_reused, 1);
    assert_eq!(counters.ops_replayed, 37);
}

/// Target's existing segment covers the first operations; they are skipped.
#[tokio::test]
async fn test_operations_already_in_files_are_skipped() {
    let source = Node::new();
    let target = Node::new();
    let old = segment(1, &[("doc-0", 0), ("doc-1", 1), ("doc-2", 2)]).encode();
    let new = segment(2, &[("doc-3", 3), ("doc-4", 4)]).encode();
    source.store.write_file("_1.seg", &old).unwrap();
    source.store.write_file("_2.seg", &new).unwrap();
    target.store.write_file("_1.seg", &old).unwrap();
    target.store.write_file("_0.seg.stale", b"left over").unwrap();

    let engine = InMemoryEngine::with_segments(vec![Arc::new(Segment::decode(&old).unwrap())])
        .unwrap();
    let metrics = Arc::new(MetricsRegistry::new());
    let service = target_service(&metrics);
    service.register_shard(shard(0), target.store.clone(), Box::new(engine));
    let start = service.start_recovery(&shard(0), NodeId::generate("source-node")).unwrap();
    assert_eq!(start.starting_seq_no, 3);
    let recovery_id = start.recovery_id;

    let manager = RecoveryManager::new(fast_settings(), Arc::clone(&metrics));
    let handle = manager.start_recovery(
        start,
        RecoverySource::new(source.store.clone(), translog(0..8)),
        Arc::new(LocalTransport::new(Arc::clone(&service))),
    );
    assert_eq!(handle.wait().await.unwrap(), 7);

    let state = service.state(recovery_id).unwrap().snapshot();
    assert_eq!(state.ops_total, 5);
    assert_eq!(state.ops_recovered, 5);
    assert_eq!(state.ops_skipped, 2);

    let names: Vec<String> = target
        .store
        .list_metadata()
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec!["_1.seg".to_string(), "_2.seg".to_string()]);

    let engine = service.engine(&shard(0)).unwrap();
    assert_eq!(engine.lock().unwrap().local_checkpoint(), 7);
}

// =============================================================================
// Exactly-once replay
// =============================================================================

fn ops_request(
    recovery_id: i64,
    seqs: std::ops::Range<i64>,
    total: u32,
) -> RecoveryRequest {
    RecoveryRequest::TranslogOps(peerrecovery::recovery::TranslogOpsRequest {
        request_seq_no: 0,
        recovery_id,
        shard_id: shard(0),
        operations: seqs
            .map(|s| TranslogOperation::index(s, 1, format!("doc-{}", s), 1, b"{}".to_vec()))
            .collect(),
        total_translog_ops: total,
    })
}

fn begin_ops(service: &RecoveryTargetService, recovery_id: i64, total: u32) {
    let info = RecoveryRequest::FilesInfo(peerrecovery::recovery::FilesInfoRequest {
        request_seq_no: 0,
        recovery_id,
        shard_id: shard(0),
        phase1_file_names: vec![],
        phase1_file_sizes: vec![],
        phase1_existing_file_names: vec![],
        phase1_existing_file_sizes: vec![],
        total_translog_ops: total,
    });
    assert_eq!(service.handle(info), RecoveryResponse::Ack);
    let complete = RecoveryRequest::FilesComplete(peerrecovery::recovery::FilesCompleteRequest {
        request_seq_no: 1,
        recovery_id,
        shard_id: shard(0),
        start_seq_no: 0,
        total_translog_ops: total,
    });
    assert_eq!(service.handle(complete), RecoveryResponse::Ack);
}

fn finalize_request(recovery_id: i64) -> RecoveryRequest {
    RecoveryRequest::Finalize(peerrecovery::recovery::FinalizeRequest {
        request_seq_no: 9,
        recovery_id,
        shard_id: shard(0),
        global_checkpoint: 36,
    })
}

#[test]
fn test_redelivered_batch_is_applied_once() {
    let target = Node::new();
    let metrics = Arc::new(MetricsRegistry::new());
    let service = target_service(&metrics);
    service.register_shard(shard(0), target.store.clone(), Box::new(InMemoryEngine::new()));
    let start = service.start_recovery(&shard(0), NodeId::generate("s")).unwrap();
    let id = start.recovery_id;
    begin_ops(&service, id, 10);

    assert_eq!(
        service.handle(ops_request(id, 0..5, 10)),
        RecoveryResponse::OpsAck { local_checkpoint: 4 }
    );
    // retry after a lost ack overlaps the applied prefix
    assert_eq!(
        service.handle(ops_request(id, 3..10, 10)),
        RecoveryResponse::OpsAck { local_checkpoint: 9 }
    );
    assert_eq!(
        service.handle(ops_request(id, 0..10, 10)),
        RecoveryResponse::OpsAck { local_checkpoint: 9 }
    );

    let state = service.state(id).unwrap();
    assert_eq!(state.ops_recovered(), 10);
    assert_eq!(metrics.snapshot().ops_replayed, 10);
    assert_eq!(
        service.handle(finalize_request(id)),
        RecoveryResponse::FinalizeAck { local_checkpoint: 9 }
    );
}

#[test]
fn test_finalize_rejected_until_all_operations_recovered() {
    let target = Node::new();
    let metrics = Arc::new(MetricsRegistry::new());
    let service = target_service(&metrics);
    service.register_shard(shard(0), target.store.clone(), Box::new(InMemoryEngine::new()));

    let first = service.start_recovery(&shard(0), NodeId::generate("s")).unwrap();
    begin_ops(&service, first.recovery_id, 37);
    service.handle(ops_request(first.recovery_id, 0..36, 37));
    match service.handle(finalize_request(first.recovery_id)) {
        RecoveryResponse::Failure { code, message } => {
            assert_eq!(code, "RECOVERY_PROTOCOL_VIOLATION");
            assert!(message.contains("36 of 37"));
        }
        other => panic!("finalize accepted early: {:?}", other),
    }
    assert_eq!(
        service.state(first.recovery_id).unwrap().phase(),
        RecoveryPhase::Failed
    );

    let second = service.start_recovery(&shard(0), NodeId::generate("s")).unwrap();
    assert_eq!(second.starting_seq_no, 0, "failed recovery left no applied state");
    begin_ops(&service, second.recovery_id, 37);
    service.handle(ops_request(second.recovery_id, 0..37, 37));
    assert_eq!(
        service.handle(finalize_request(second.recovery_id)),
        RecoveryResponse::FinalizeAck { local_checkpoint: 36 }
    );
}

#[test]
fn test_sequence_gap_fails_recovery() {
    let target = Node::new();
    let metrics = Arc::new(MetricsRegistry::new());
    let service = target_service(&metrics);
    service.register_shard(shard(0), target.store.clone(), Box::new(InMemoryEngine::new()));
    let start = service.start_recovery(&shard(0), NodeId::generate("s")).unwrap();
    begin_ops(&service, start.recovery_id, 10);

    match service.handle(ops_request(start.recovery_id, 1..4, 10)) {
        RecoveryResponse::Failure { code, .. } => assert_eq!(code, "RECOVERY_SEQUENCE_GAP"),
        other => panic!("gap accepted: {:?}", other),
    }
}

#[tokio::test]
async fn test_source_with_history_gap_fails() {
    let source = Node::new();
    let target = Node::new();
    let mut log = translog(0..3);
    log.add(TranslogOperation::index(5, 1, "doc-5", 1, b"{}".to_vec()))
        .unwrap();

    let metrics = Arc::new(MetricsRegistry::new());
    let service = target_service(&metrics);
    service.register_shard(shard(0), target.store.clone(), Box::new(InMemoryEngine::new()));
    let start = service.start_recovery(&shard(0), NodeId::generate("s")).unwrap();
    let recovery_id = start.recovery_id;

    let manager = RecoveryManager::new(fast_settings(), Arc::clone(&metrics));
    let handle = manager.start_recovery(
        start,
        RecoverySource::new(source.store.clone(), log),
        Arc::new(LocalTransport::new(Arc::clone(&service))),
    );
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), RecoveryErrorKind::SequenceGap);
    assert_eq!(err.phase(), Some(RecoveryPhase::Ops));
    assert_eq!(
        service.state(recovery_id).unwrap().phase(),
        RecoveryPhase::Failed
    );
    assert_eq!(metrics.snapshot().recoveries_failed, 1);
}

// =============================================================================
// Failure paths leave no staged files
// =============================================================================

#[tokio::test]
async fn test_corrupted_chunk_fails_and_removes_partial_file() {
    let source = Node::new();
    let target = Node::new();
    source.store.write_file("big", &vec![1u8; 200]).unwrap();

    let metrics = Arc::new(MetricsRegistry::new());
    let service = target_service(&metrics);
    service.register_shard(shard(0), target.store.clone(), Box::new(InMemoryEngine::new()));
    let start = service.start_recovery(&shard(0), NodeId::generate("s")).unwrap();
    let recovery_id = start.recovery_id;

    let mut transport = TestTransport::new(&service);
    transport.corrupt_chunks = true;
    let settings = RecoverySettings {
        max_concurrent_file_chunks: 1,
        ..fast_settings()
    };
    let manager = RecoveryManager::new(settings, Arc::clone(&metrics));
    let handle = manager.start_recovery(
        start,
        RecoverySource::new(source.store.clone(), Translog::in_memory()),
        Arc::new(transport),
    );
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), RecoveryErrorKind::ChecksumMismatch);

    let target_state = service.state(recovery_id).unwrap().snapshot();
    assert_eq!(target_state.phase, RecoveryPhase::Failed);
    assert!(!target_state.cancelled);
    assert!(target.store.temp_files().unwrap().is_empty());
    assert!(target.store.list_metadata().unwrap().is_empty());
    assert_eq!(metrics.snapshot().chunk_mismatches, 1);
    assert_eq!(source.store.pinned_files(), 0);
}

#[tokio::test]
async fn test_request_timeout_fails_session() {
    let source = Node::new();
    let target = Node::new();
    source.store.write_file("f", b"some bytes").unwrap();

    let metrics = Arc::new(MetricsRegistry::new());
    let service = target_service(&metrics);
    service.register_shard(
        shard(0),
        target.store.clone(),
        Box::new(SlowEngine {
            inner: InMemoryEngine::new(),
            delay: Duration::from_millis(500),
        }),
    );
    let start = service.start_recovery(&shard(0), NodeId::generate("s")).unwrap();
    let recovery_id = start.recovery_id;

    let settings = RecoverySettings {
        internal_action_timeout_ms: 100,
        internal_action_long_timeout_ms: 100,
        ..fast_settings()
    };
    let manager = RecoveryManager::new(settings, Arc::clone(&metrics));
    let handle = manager.start_recovery(
        start,
        RecoverySource::new(source.store.clone(), translog(0..2)),
        Arc::new(LocalTransport::new(Arc::clone(&service))),
    );
    let source_state = handle.state();
    let err = handle.wait().await.unwrap_err();

    assert_eq!(err.kind(), RecoveryErrorKind::Timeout);
    assert_eq!(err.phase(), Some(RecoveryPhase::Ops));
    assert_eq!(source_state.phase(), RecoveryPhase::Failed);
    assert!(!source_state.is_cancelled());
    // the cancel sent after the timeout waited for the slow batch to finish
    assert!(target.store.temp_files().unwrap().is_empty());
    assert_eq!(
        service.state(recovery_id).unwrap().phase(),
        RecoveryPhase::Failed
    );
}

#[tokio::test]
async fn test_cancel_mid_ops_leaves_no_temp_files() {
    let source = Node::new();
    let target = Node::new();
    source.store.write_file("seg-data", &vec![3u8; 64]).unwrap();

    let metrics = Arc::new(MetricsRegistry::new());
    let service = target_service(&metrics);
    service.register_shard(
        shard(0),
        target.store.clone(),
        Box::new(SlowEngine {
            inner: InMemoryEngine::new(),
            delay: Duration::from_millis(5),
        }),
    );
    let start = service.start_recovery(&shard(0), NodeId::generate("s")).unwrap();
    let recovery_id = start.recovery_id;

    let manager = RecoveryManager::new(fast_settings(), Arc::clone(&metrics));
    let handle = manager.start_recovery(
        start,
        RecoverySource::new(source.store.clone(), translog(0..400)),
        Arc::new(LocalTransport::new(Arc::clone(&service))),
    );
    let source_state = handle.state();

    tokio::time::timeout(Duration::from_secs(10), async {
        while source_state.phase() != RecoveryPhase::Ops {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("recovery never reached OPS");
    assert!(manager.cancel(recovery_id, "shard relocated"));

    let err = handle.wait().await.unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(err.message(), "shard relocated");

    let source_snapshot = source_state.snapshot();
    assert_eq!(source_snapshot.phase, RecoveryPhase::Failed);
    assert!(source_snapshot.cancelled);

    let target_snapshot = service.state(recovery_id).unwrap().snapshot();
    assert_eq!(target_snapshot.phase, RecoveryPhase::Failed);
    assert!(target_snapshot.cancelled);
    assert!(target.store.temp_files().unwrap().is_empty());
    assert!(target.store.list_metadata().unwrap().is_empty());
    assert_eq!(source.store.pinned_files(), 0);
    assert_eq!(metrics.snapshot().recoveries_cancelled, 1);
    assert_eq!(manager.active_sessions(), 0);
}

// =============================================================================
// Concurrency limit
// =============================================================================

#[tokio::test]
async fn test_concurrency_limit_serialises_file_phases() {
    let metrics = Arc::new(MetricsRegistry::new());
    let service = target_service(&metrics);
    let settings = RecoverySettings {
        max_concurrent_recoveries: 1,
        ..fast_settings()
    };
    let manager = RecoveryManager::new(settings, Arc::clone(&metrics));

    let mut transport = TestTransport::new(&service);
    transport.chunk_delay = Some(Duration::from_millis(5));
    let transport = Arc::new(transport);

    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for n in 0..3 {
        let source = Node::new();
        let target = Node::new();
        source.store.write_file("data", &vec![n as u8; 80]).unwrap();
        service.register_shard(shard(n), target.store.clone(), Box::new(InMemoryEngine::new()));
        let start = service.start_recovery(&shard(n), NodeId::generate("s")).unwrap();
        handles.push(manager.start_recovery(
            start,
            RecoverySource::new(source.store.clone(), translog(0..3)),
            Arc::clone(&transport) as Arc<dyn RecoveryTransport>,
        ));
        nodes.push((source, target));
    }

    for handle in handles {
        assert_eq!(handle.wait().await.unwrap(), 2);
    }
    assert_eq!(transport.files_max.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.snapshot().recoveries_completed, 3);
    for (source, target) in &nodes {
        assert_eq!(
            target.store.list_metadata().unwrap(),
            source.store.list_metadata().unwrap()
        );
    }
}

#[tokio::test]
async fn test_cancel_while_queued_never_starts() {
    let metrics = Arc::new(MetricsRegistry::new());
    let service = target_service(&metrics);
    let settings = RecoverySettings {
        max_concurrent_recoveries: 1,
        ..fast_settings()
    };
    let manager = RecoveryManager::new(settings, Arc::clone(&metrics));

    let busy_source = Node::new();
    let busy_target = Node::new();
    service.register_shard(
        shard(0),
        busy_target.store.clone(),
        Box::new(SlowEngine {
            inner: InMemoryEngine::new(),
            delay: Duration::from_millis(2),
        }),
    );
    let busy_start = service.start_recovery(&shard(0), NodeId::generate("s")).unwrap();
    let busy = manager.start_recovery(
        busy_start,
        RecoverySource::new(busy_source.store.clone(), translog(0..50)),
        Arc::new(LocalTransport::new(Arc::clone(&service))),
    );

    let queued_source = Node::new();
    let queued_target = Node::new();
    queued_source.store.write_file("x", b"xx").unwrap();
    service.register_shard(shard(1), queued_target.store.clone(), Box::new(InMemoryEngine::new()));
    let queued_start = service.start_recovery(&shard(1), NodeId::generate("s")).unwrap();
    let queued_id = queued_start.recovery_id;
    let queued = manager.start_recovery(
        queued_start,
        RecoverySource::new(queued_source.store.clone(), Translog::in_memory()),
        Arc::new(LocalTransport::new(Arc::clone(&service))),
    );
    assert_eq!(queued.snapshot().phase, RecoveryPhase::Init);
    assert!(queued.cancel("allocator changed its mind"));

    let err = queued.wait().await.unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(err.phase(), Some(RecoveryPhase::Init));
    assert!(service.state(queued_id).unwrap().is_cancelled());
    assert!(queued_target.store.list_metadata().unwrap().is_empty());

    assert_eq!(busy.wait().await.unwrap(), 49);
    let counters = metrics.snapshot();
    assert_eq!(counters.recoveries_started, 1);
    assert_eq!(counters.recoveries_cancelled, 1);
}
