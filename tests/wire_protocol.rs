//! Wire Protocol Tests
//!
//! Frames decoded by the target service exactly as they arrive off the wire:
//! - A file inventory keeps every list and drives the target into FILES
//! - Malformed frames are structured failures that change no state
//! - The incremental diff and the durable translog agree across stores

use std::sync::Arc;

use peerrecovery::engine::InMemoryEngine;
use peerrecovery::observability::MetricsRegistry;
use peerrecovery::recovery::{
    diff, FilesInfoRequest, RecoveryErrorKind, RecoveryPhase, RecoveryRequest, RecoveryResponse,
    RecoveryTargetService, StartRecoveryRequest,
};
use peerrecovery::shard::{IndexId, NodeId, ShardId};
use peerrecovery::store::{FileMetadata, ShardStore};
use peerrecovery::stream::{CodecError, StreamOutput};
use peerrecovery::translog::{Translog, TranslogOperation};
use tempfile::TempDir;

// =============================================================================
// Test Utilities
// =============================================================================

fn shard() -> ShardId {
    ShardId::new(IndexId::new("metrics", "wire-uuid"), 3)
}

fn service(dir: &TempDir) -> RecoveryTargetService {
    let service = RecoveryTargetService::new(
        NodeId::generate("target"),
        Arc::new(MetricsRegistry::new()),
    );
    service.register_shard(
        shard(),
        ShardStore::open(dir.path()).unwrap(),
        Box::new(InMemoryEngine::new()),
    );
    service
}

fn inventory(recovery_id: i64) -> FilesInfoRequest {
    FilesInfoRequest {
        request_seq_no: 0,
        recovery_id,
        shard_id: shard(),
        phase1_file_names: vec!["_2.seg".into(), "commit".into()],
        phase1_file_sizes: vec![120, 9],
        phase1_existing_file_names: vec!["_1.seg".into()],
        phase1_existing_file_sizes: vec![5],
        total_translog_ops: 7,
    }
}

fn decode_reply(bytes: &[u8]) -> RecoveryResponse {
    RecoveryResponse::decode(bytes).unwrap()
}

// =============================================================================
// File Inventory
// =============================================================================

#[test]
fn test_inventory_frame_keeps_every_list() {
    let request = RecoveryRequest::FilesInfo(inventory(41));
    let decoded = RecoveryRequest::decode(&request.encode()).unwrap();

    match decoded {
        RecoveryRequest::FilesInfo(info) => {
            assert_eq!(info.recovery_id, 41);
            assert_eq!(info.shard_id, shard());
            assert_eq!(info.phase1_file_names, vec!["_2.seg", "commit"]);
            assert_eq!(info.phase1_file_sizes, vec![120, 9]);
            assert_eq!(info.phase1_existing_file_names, vec!["_1.seg"]);
            assert_eq!(info.phase1_existing_file_sizes, vec![5]);
            assert_eq!(info.total_translog_ops, 7);
        }
        other => panic!("decoded as {:?}", other),
    }
}

#[test]
fn test_inventory_frame_starts_file_phase() {
    let dir = TempDir::new().unwrap();
    ShardStore::open(dir.path())
        .unwrap()
        .write_file("_1.seg", b"hello")
        .unwrap();
    let service = service(&dir);
    let start = service
        .start_recovery(&shard(), NodeId::generate("source"))
        .unwrap();

    let frame = RecoveryRequest::FilesInfo(inventory(start.recovery_id)).encode();
    assert_eq!(decode_reply(&service.handle_bytes(&frame)), RecoveryResponse::Ack);

    let state = service.state(start.recovery_id).unwrap().snapshot();
    assert_eq!(state.phase, RecoveryPhase::Files);
    assert_eq!(state.files_total, 3);
    assert_eq!(state.files_reused, 1);
    assert_eq!(state.bytes_total, 134);
    assert_eq!(state.bytes_reused, 5);
    assert_eq!(state.ops_total, 7);

    let temps = ShardStore::open(dir.path()).unwrap().temp_files().unwrap();
    assert_eq!(temps.len(), 2);
}

// =============================================================================
// Malformed Frames
// =============================================================================

#[test]
fn test_oversized_list_count_is_structured_error() {
    let mut out = StreamOutput::new();
    out.write_u8(1);
    out.write_i64(0);
    out.write_i64(9);
    shard().write_to(&mut out);
    out.write_vint(1_000_000);
    out.write_string("only-one");
    let frame = out.into_bytes();

    match RecoveryRequest::decode(&frame) {
        Err(CodecError::CountTooLarge { what, declared, .. }) => {
            assert_eq!(what, "phase1 file names");
            assert_eq!(declared, 1_000_000);
        }
        other => panic!("expected CountTooLarge, got {:?}", other),
    }
}

#[test]
fn test_malformed_frame_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);
    let start = service
        .start_recovery(&shard(), NodeId::generate("source"))
        .unwrap();

    let mut frame = RecoveryRequest::FilesInfo(inventory(start.recovery_id)).encode();
    frame.truncate(frame.len() - 3);

    match decode_reply(&service.handle_bytes(&frame)) {
        RecoveryResponse::Failure { code, message } => {
            assert_eq!(code, RecoveryErrorKind::Transport.code());
            assert!(message.contains("malformed"), "{}", message);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(
        service.state(start.recovery_id).unwrap().phase(),
        RecoveryPhase::Init
    );
    assert!(ShardStore::open(dir.path()).unwrap().temp_files().unwrap().is_empty());
}

#[test]
fn test_start_request_with_metadata_survives_the_wire() {
    let start = StartRecoveryRequest {
        recovery_id: 12,
        shard_id: shard(),
        source_node: NodeId::generate("a"),
        target_node: NodeId::generate("b"),
        metadata_snapshot: vec![
            FileMetadata::new("_1.seg", 5, 0xFFFF_0001),
            FileMetadata::new("commit", 0, 0),
        ],
        starting_seq_no: 33,
    };
    let decoded = StartRecoveryRequest::decode(&start.encode()).unwrap();
    assert_eq!(decoded, start);
}

// =============================================================================
// Diff and Translog
// =============================================================================

#[test]
fn test_diff_between_real_stores() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let source = ShardStore::open(source_dir.path()).unwrap();
    let target = ShardStore::open(target_dir.path()).unwrap();

    source.write_file("_1.seg", b"first").unwrap();
    source.write_file("_2.seg", b"second").unwrap();
    source.write_file("commit", b"v2").unwrap();
    target.write_file("_1.seg", b"first").unwrap();
    target.write_file("commit", b"v1").unwrap();

    let inventory = diff(
        &source.list_metadata().unwrap(),
        &target.list_metadata().unwrap(),
    );
    let sent: Vec<&str> = inventory.to_send().iter().map(|f| f.name.as_str()).collect();
    let kept: Vec<&str> = inventory
        .already_present()
        .iter()
        .map(|f| f.name.as_str())
        .collect();
    assert_eq!(sent, vec!["_2.seg", "commit"]);
    assert_eq!(kept, vec!["_1.seg"]);
    assert_eq!(inventory.bytes_reused(), 5);
    assert_eq!(inventory.bytes_to_send(), 8);
}

#[test]
fn test_translog_reopens_with_history() {
    let dir = TempDir::new().unwrap();
    {
        let mut log = Translog::open_in_shard(dir.path()).unwrap();
        log.add(TranslogOperation::index(0, 1, "a", 1, b"{}".to_vec())).unwrap();
        log.add(TranslogOperation::delete(1, 1, "a", 2)).unwrap();
        log.add(TranslogOperation::no_op(2, 1, "fill")).unwrap();
    }

    let log = Translog::open_in_shard(dir.path()).unwrap();
    assert_eq!(log.max_seq_no(), 2);
    let seq_nos: Vec<i64> = log.snapshot(1, 2).map(|op| op.seq_no).collect();
    assert_eq!(seq_nos, vec![1, 2]);
}
