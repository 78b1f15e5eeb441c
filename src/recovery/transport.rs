//! Request/response channel between a recovery source and its target
//!
//! Each send carries its own timeout. A reply of `Failure` surfaces as the
//! error the target reported.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use super::errors::{RecoveryError, RecoveryResult};
use super::messages::{RecoveryRequest, RecoveryResponse};
use super::target_service::RecoveryTargetService;

/// Sends recovery requests to the target node.
pub trait RecoveryTransport: Send + Sync {
    /// Deliver `request` and wait at most `timeout` for the reply.
    fn send(
        &self,
        request: RecoveryRequest,
        timeout: Duration,
    ) -> BoxFuture<'_, RecoveryResult<RecoveryResponse>>;
}

/// In-process transport.
///
/// Requests still go through the wire encoding, and the target handles them
/// on the blocking pool, so timeouts and framing behave as they would across
/// nodes.
#[derive(Clone)]
pub struct LocalTransport {
    target: Arc<RecoveryTargetService>,
}

impl LocalTransport {
    pub fn new(target: Arc<RecoveryTargetService>) -> Self {
        Self { target }
    }
}

impl RecoveryTransport for LocalTransport {
    fn send(
        &self,
        request: RecoveryRequest,
        timeout: Duration,
    ) -> BoxFuture<'_, RecoveryResult<RecoveryResponse>> {
        Box::pin(async move {
            let action = request.action();
            let frame = request.encode();
            let service = Arc::clone(&self.target);
            let call = tokio::task::spawn_blocking(move || service.handle_bytes(&frame));

            let joined = tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| RecoveryError::timeout(action, timeout.as_millis() as u64))?;
            let reply = joined.map_err(|e| {
                RecoveryError::transport(format!("{} handler did not complete: {}", action, e))
            })?;
            RecoveryResponse::decode(&reply)?.into_result()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryEngine;
    use crate::observability::MetricsRegistry;
    use crate::recovery::errors::RecoveryErrorKind;
    use crate::recovery::messages::{CancelRequest, FinalizeRequest};
    use crate::shard::{IndexId, NodeId, ShardId};
    use crate::store::ShardStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_round_trip_and_remote_failure() {
        let dir = TempDir::new().unwrap();
        let shard = ShardId::new(IndexId::new("i", "u"), 0);
        let service = Arc::new(RecoveryTargetService::new(
            NodeId::generate("t"),
            Arc::new(MetricsRegistry::new()),
        ));
        service.register_shard(
            shard.clone(),
            ShardStore::open(dir.path()).unwrap(),
            Box::new(InMemoryEngine::new()),
        );
        let start = service.start_recovery(&shard, NodeId::generate("s")).unwrap();
        let transport = LocalTransport::new(Arc::clone(&service));

        let cancel = RecoveryRequest::Cancel(CancelRequest {
            recovery_id: start.recovery_id,
            shard_id: shard.clone(),
            reason: "test".into(),
        });
        let reply = transport.send(cancel, Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, RecoveryResponse::Ack);

        let unknown = RecoveryRequest::Finalize(FinalizeRequest {
            request_seq_no: 0,
            recovery_id: -1,
            shard_id: shard,
            global_checkpoint: 0,
        });
        let err = transport.send(unknown, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), RecoveryErrorKind::ProtocolViolation);
        assert!(err.message().starts_with("target failed"));
    }
}
