//! Recovery manager: runs sessions as independent tasks
//!
//! Sessions wait in INIT for a permit; at most `max_concurrent_recoveries`
//! run at once on a node. A session cancelled while still queued only
//! tells the target to drop its side.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::config::RecoverySettings;
use super::errors::{RecoveryError, RecoveryResult};
use super::messages::StartRecoveryRequest;
use super::session::{CancellationToken, RecoverySession};
use super::source::{RecoverySource, RecoverySourceHandler};
use super::state::{RecoveryState, RecoveryStateSnapshot};
use super::transport::RecoveryTransport;
use crate::observability::{Event, Logger, MetricsRegistry};
use crate::shard::ShardId;

/// Handle to a running session.
pub struct RecoveryHandle {
    session: Arc<RecoverySession>,
    task: JoinHandle<RecoveryResult<i64>>,
}

impl RecoveryHandle {
    pub fn recovery_id(&self) -> i64 {
        self.session.recovery_id()
    }

    pub fn shard_id(&self) -> &ShardId {
        self.session.shard_id()
    }

    pub fn state(&self) -> Arc<RecoveryState> {
        Arc::clone(self.session.state())
    }

    pub fn snapshot(&self) -> RecoveryStateSnapshot {
        self.session.state().snapshot()
    }

    /// Request cancellation; the session stops at its next boundary.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.session.cancel_token().cancel(reason)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.session.cancel_token().clone()
    }

    /// Wait for the session to end; `Ok` carries the target's local
    /// checkpoint.
    pub async fn wait(self) -> RecoveryResult<i64> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(RecoveryError::storage(format!(
                "recovery task did not complete: {}",
                err
            ))
            .with_context(self.session.recovery_id(), self.session.shard_id())),
        }
    }
}

/// Runs recovery sessions for the shards a node is the source of.
pub struct RecoveryManager {
    settings: RecoverySettings,
    permits: Arc<Semaphore>,
    metrics: Arc<MetricsRegistry>,
    running: Arc<Mutex<HashMap<i64, Arc<RecoverySession>>>>,
}

impl RecoveryManager {
    pub fn new(settings: RecoverySettings, metrics: Arc<MetricsRegistry>) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_recoveries.max(1)));
        Self {
            settings,
            permits,
            metrics,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &RecoverySettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Sessions queued or running.
    pub fn active_sessions(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Cancel a session by id. Returns false if it is unknown or already
    /// cancelled.
    pub fn cancel(&self, recovery_id: i64, reason: &str) -> bool {
        let session = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&recovery_id)
            .cloned();
        session
            .map(|s| s.cancel_token().cancel(reason))
            .unwrap_or(false)
    }

    /// Queue a session answering `start` and spawn its task.
    pub fn start_recovery(
        &self,
        start: StartRecoveryRequest,
        source: RecoverySource,
        transport: Arc<dyn RecoveryTransport>,
    ) -> RecoveryHandle {
        let session = Arc::new(RecoverySession::new(&start));
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.recovery_id(), Arc::clone(&session));

        let fields = session.log_fields();
        let refs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        Logger::event(Event::RecoveryQueued, &refs);

        let handler = RecoverySourceHandler::new(
            Arc::clone(&session),
            source,
            transport,
            self.settings.clone(),
            Arc::clone(&self.metrics),
        );
        let task = tokio::spawn(run_session(
            Arc::clone(&session),
            start,
            handler,
            Arc::clone(&self.permits),
            Arc::clone(&self.metrics),
            Arc::clone(&self.running),
        ));
        RecoveryHandle { session, task }
    }
}

async fn run_session(
    session: Arc<RecoverySession>,
    start: StartRecoveryRequest,
    handler: RecoverySourceHandler,
    permits: Arc<Semaphore>,
    metrics: Arc<MetricsRegistry>,
    running: Arc<Mutex<HashMap<i64, Arc<RecoverySession>>>>,
) -> RecoveryResult<i64> {
    let fields = session.log_fields();
    let refs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let token = session.cancel_token().clone();

    let permit = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        permit = permits.acquire_owned() => permit.ok(),
    };

    let result = match permit {
        Some(permit) => {
            metrics.increment_recoveries_started();
            Logger::event(Event::RecoveryStart, &refs);
            let result = handler.run(&start).await;
            drop(permit);
            result
        }
        None => {
            let err = token
                .check()
                .err()
                .unwrap_or_else(|| RecoveryError::storage("recovery permits closed"))
                .with_context(session.recovery_id(), session.shard_id())
                .in_phase(session.state().phase());
            session.state().fail(err.to_string(), err.is_cancellation());
            handler.notify_target_cancelled(err.message()).await;
            Err(err)
        }
    };

    match &result {
        Ok(checkpoint) => {
            metrics.increment_recoveries_completed();
            let checkpoint = checkpoint.to_string();
            let snapshot = session.state().snapshot();
            let bytes = snapshot.bytes_transferred.to_string();
            let ops = snapshot.ops_recovered.to_string();
            let mut done = refs.clone();
            done.extend([
                ("local_checkpoint", checkpoint.as_str()),
                ("bytes_transferred", bytes.as_str()),
                ("ops_recovered", ops.as_str()),
            ]);
            Logger::event(Event::RecoveryComplete, &done);
        }
        Err(err) => {
            let mut failed = refs.clone();
            failed.extend([("code", err.kind().code()), ("reason", err.message())]);
            if err.is_cancellation() {
                metrics.increment_recoveries_cancelled();
                Logger::event(Event::RecoveryCancelled, &failed);
            } else {
                metrics.increment_recoveries_failed();
                let event = if err.is_fatal() {
                    Event::InconsistentSegment
                } else {
                    Event::RecoveryFailed
                };
                Logger::event(event, &failed);
            }
        }
    }

    running
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&session.recovery_id());
    result
}
