//! Node-level registry of recovery targets
//!
//! Owns the shards a node can recover into and routes incoming requests to
//! the target of their recovery id. At most one recovery is active per
//! shard; starting a new one supersedes the previous.
//!
//! A target is dropped as soon as it reaches DONE or FAILED. Only the state
//! of the shard's most recent finished recovery is kept for reporting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::errors::{RecoveryError, RecoveryResult};
use super::messages::{RecoveryRequest, RecoveryResponse, StartRecoveryRequest};
use super::state::RecoveryState;
use super::target::{RecoveryTarget, SharedEngine};
use crate::engine::StorageEngine;
use crate::observability::{Event, Logger, MetricsRegistry};
use crate::shard::{NodeId, ShardId};
use crate::store::ShardStore;

static NEXT_RECOVERY_ID: AtomicI64 = AtomicI64::new(1);

/// Process-wide unique recovery id.
pub fn next_recovery_id() -> i64 {
    NEXT_RECOVERY_ID.fetch_add(1, Ordering::Relaxed)
}

struct ShardSlot {
    store: ShardStore,
    engine: SharedEngine,
    active: Option<i64>,
    last_finished: Option<(i64, Arc<RecoveryState>)>,
}

/// Recovery targets hosted by one node.
pub struct RecoveryTargetService {
    node: NodeId,
    metrics: Arc<MetricsRegistry>,
    shards: Mutex<HashMap<ShardId, ShardSlot>>,
    targets: Mutex<HashMap<i64, Arc<Mutex<RecoveryTarget>>>>,
}

impl RecoveryTargetService {
    pub fn new(node: NodeId, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            node,
            metrics,
            shards: Mutex::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Make `shard_id` recoverable on this node.
    pub fn register_shard(&self, shard_id: ShardId, store: ShardStore, engine: Box<dyn StorageEngine>) {
        let mut shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        shards.insert(
            shard_id,
            ShardSlot {
                store,
                engine: Arc::new(Mutex::new(engine)),
                active: None,
                last_finished: None,
            },
        );
    }

    pub fn engine(&self, shard_id: &ShardId) -> Option<SharedEngine> {
        let shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        shards.get(shard_id).map(|slot| Arc::clone(&slot.engine))
    }

    /// Open a recovery for `shard_id` and build the request that starts it
    /// on the source.
    ///
    /// Any recovery still active for the shard is cancelled first.
    pub fn start_recovery(
        &self,
        shard_id: &ShardId,
        source_node: NodeId,
    ) -> RecoveryResult<StartRecoveryRequest> {
        let mut shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = shards.get_mut(shard_id).ok_or_else(|| {
            RecoveryError::protocol(format!("shard {} is not hosted on {}", shard_id, self.node))
        })?;

        let recovery_id = next_recovery_id();
        if let Some(previous) = slot.active.take() {
            let removed = self
                .targets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&previous);
            if let Some(target) = removed {
                let reason = format!("superseded by recovery [{}]", recovery_id);
                let mut target = target.lock().unwrap_or_else(PoisonError::into_inner);
                if !target.state().is_terminal() {
                    target.cancel(&reason);
                    Logger::event(
                        Event::RecoverySuperseded,
                        &[
                            ("recovery_id", &previous.to_string()),
                            ("shard", &shard_id.to_string()),
                            ("superseded_by", &recovery_id.to_string()),
                        ],
                    );
                }
                slot.last_finished = Some((previous, Arc::clone(target.state())));
            }
        }

        let metadata_snapshot = slot.store.list_metadata()?;
        let starting_seq_no = {
            let engine = slot.engine.lock().unwrap_or_else(PoisonError::into_inner);
            engine.local_checkpoint() + 1
        };

        let target = RecoveryTarget::new(
            recovery_id,
            shard_id.clone(),
            slot.store.clone(),
            Arc::clone(&slot.engine),
            Arc::clone(&self.metrics),
        );
        slot.active = Some(recovery_id);
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(recovery_id, Arc::new(Mutex::new(target)));

        Ok(StartRecoveryRequest {
            recovery_id,
            shard_id: shard_id.clone(),
            source_node,
            target_node: self.node.clone(),
            metadata_snapshot,
            starting_seq_no,
        })
    }

    fn target(&self, recovery_id: i64) -> Option<Arc<Mutex<RecoveryTarget>>> {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&recovery_id)
            .cloned()
    }

    /// Progress of a running recovery, or the final state of a shard's most
    /// recent finished one.
    pub fn state(&self, recovery_id: i64) -> Option<Arc<RecoveryState>> {
        if let Some(target) = self.target(recovery_id) {
            let target = target.lock().unwrap_or_else(PoisonError::into_inner);
            return Some(Arc::clone(target.state()));
        }
        let shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        shards.values().find_map(|slot| match &slot.last_finished {
            Some((id, state)) if *id == recovery_id => Some(Arc::clone(state)),
            _ => None,
        })
    }

    /// Targets currently held in the registry.
    pub fn open_targets(&self) -> usize {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Recoveries not yet DONE or FAILED.
    pub fn active_recoveries(&self) -> usize {
        let targets: Vec<_> = self
            .targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        targets
            .iter()
            .filter(|t| {
                !t.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .state()
                    .is_terminal()
            })
            .count()
    }

    /// Forget the retained state of a finished recovery. Returns false if
    /// it is unknown or still running.
    pub fn remove(&self, recovery_id: i64) -> bool {
        if let Some(target) = self.target(recovery_id) {
            if !target
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .state()
                .is_terminal()
            {
                return false;
            }
            self.retire(recovery_id);
        }
        let mut shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        for slot in shards.values_mut() {
            if matches!(&slot.last_finished, Some((id, _)) if *id == recovery_id) {
                slot.last_finished = None;
                return true;
            }
        }
        false
    }

    /// Drop a terminal target from the registry, keeping its final state on
    /// the shard slot.
    fn retire(&self, recovery_id: i64) {
        let mut shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = self
            .targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&recovery_id);
        let Some(target) = removed else {
            return;
        };
        let target = target.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = shards.get_mut(target.shard_id()) {
            if slot.active == Some(recovery_id) {
                slot.active = None;
            }
            slot.last_finished = Some((recovery_id, Arc::clone(target.state())));
        }
    }

    /// Route one request to its target.
    ///
    /// A cancel for a recovery that is no longer registered is acknowledged,
    /// since it has already finished or been superseded.
    pub fn handle(&self, request: RecoveryRequest) -> RecoveryResponse {
        let recovery_id = request.recovery_id();
        let Some(target) = self.target(recovery_id) else {
            if matches!(request, RecoveryRequest::Cancel(_)) {
                return RecoveryResponse::Ack;
            }
            let err = RecoveryError::protocol(format!("unknown recovery [{}]", recovery_id));
            return RecoveryResponse::failure(&err);
        };
        let (response, terminal) = {
            let mut target = target.lock().unwrap_or_else(PoisonError::into_inner);
            if target.shard_id() != request.shard_id() {
                let err = RecoveryError::protocol(format!(
                    "recovery [{}] is for shard {}, request names {}",
                    recovery_id,
                    target.shard_id(),
                    request.shard_id()
                ));
                return RecoveryResponse::failure(&err);
            }
            let response = target.handle(request);
            (response, target.state().is_terminal())
        };
        if terminal {
            self.retire(recovery_id);
        }
        response
    }

    /// Decode, handle and encode one request frame.
    pub fn handle_bytes(&self, data: &[u8]) -> Vec<u8> {
        let response = match RecoveryRequest::decode(data) {
            Ok(request) => self.handle(request),
            Err(err) => RecoveryResponse::failure(&RecoveryError::from(err)),
        };
        response.encode()
    }
}
