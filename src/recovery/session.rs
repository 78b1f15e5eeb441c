//! Recovery session identity and cooperative cancellation

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::errors::{RecoveryError, RecoveryResult};
use super::messages::StartRecoveryRequest;
use super::state::RecoveryState;
use crate::shard::{NodeId, ShardId};

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

/// Cancellation flag shared by a session and whoever may cancel it.
///
/// Checked at chunk and batch boundaries, and awaited alongside outstanding
/// sends so they can be abandoned.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with `reason`. Returns false if already cancelled; the first
    /// reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        {
            let mut slot = self.inner.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if self.inner.cancelled.load(Ordering::Acquire) {
                return false;
            }
            *slot = Some(reason.into());
            self.inner.cancelled.store(true, Ordering::Release);
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> RecoveryResult<()> {
        if self.is_cancelled() {
            return Err(RecoveryError::cancelled(
                self.reason().unwrap_or_else(|| "cancelled".to_string()),
            ));
        }
        Ok(())
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// One attempt to recover a shard copy from `source_node` onto `target_node`.
#[derive(Debug)]
pub struct RecoverySession {
    recovery_id: i64,
    shard_id: ShardId,
    source_node: NodeId,
    target_node: NodeId,
    created_at: DateTime<Utc>,
    starting_seq_no: i64,
    cancel: CancellationToken,
    state: Arc<RecoveryState>,
    request_seq_no: AtomicI64,
}

impl RecoverySession {
    pub fn new(start: &StartRecoveryRequest) -> Self {
        Self::with_token(start, CancellationToken::new())
    }

    pub fn with_token(start: &StartRecoveryRequest, cancel: CancellationToken) -> Self {
        Self {
            recovery_id: start.recovery_id,
            shard_id: start.shard_id.clone(),
            source_node: start.source_node.clone(),
            target_node: start.target_node.clone(),
            created_at: Utc::now(),
            starting_seq_no: start.starting_seq_no,
            cancel,
            state: Arc::new(RecoveryState::new()),
            request_seq_no: AtomicI64::new(0),
        }
    }

    pub fn recovery_id(&self) -> i64 {
        self.recovery_id
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn source_node(&self) -> &NodeId {
        &self.source_node
    }

    pub fn target_node(&self) -> &NodeId {
        &self.target_node
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn starting_seq_no(&self) -> i64 {
        self.starting_seq_no
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> &Arc<RecoveryState> {
        &self.state
    }

    /// Next value for a request's `request_seq_no` header.
    pub fn next_request_seq_no(&self) -> i64 {
        self.request_seq_no.fetch_add(1, Ordering::Relaxed)
    }

    /// Identity fields repeated on every log line of this session.
    pub fn log_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("recovery_id", self.recovery_id.to_string()),
            ("shard", self.shard_id.to_string()),
            ("source_node", self.source_node.name.clone()),
            ("target_node", self.target_node.name.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::IndexId;
    use std::time::Duration;

    fn start() -> StartRecoveryRequest {
        StartRecoveryRequest {
            recovery_id: 3,
            shard_id: ShardId::new(IndexId::new("logs", "u"), 0),
            source_node: NodeId::generate("a"),
            target_node: NodeId::generate("b"),
            metadata_snapshot: Vec::new(),
            starting_seq_no: 5,
        }
    }

    #[test]
    fn test_first_cancel_reason_wins() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        assert!(token.cancel("node left"));
        assert!(!token.cancel("superseded"));
        assert_eq!(token.reason().as_deref(), Some("node left"));
        let err = token.check().unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(err.message(), "node left");
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("stop");
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_future_ready_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel("early");
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_session_identity() {
        let session = RecoverySession::new(&start());
        assert_eq!(session.recovery_id(), 3);
        assert_eq!(session.starting_seq_no(), 5);
        assert_eq!(session.next_request_seq_no(), 0);
        assert_eq!(session.next_request_seq_no(), 1);
        assert!(session.created_at() <= Utc::now());
        assert_eq!(session.log_fields()[1].1, "[logs][0]");
    }
}
