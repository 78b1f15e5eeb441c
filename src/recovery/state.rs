//! Recovery phase machine and progress counters
//!
//! `INIT → FILES → OPS → FINALIZE → DONE`, and any non-terminal phase may
//! move to `FAILED`. `DONE` and `FAILED` are terminal. An illegal transition
//! is rejected and leaves the phase unchanged.
//!
//! The phase and every counter are atomics: the driving task writes them,
//! monitors read them at any time without blocking it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use super::errors::{RecoveryError, RecoveryResult};

/// Recovery phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPhase {
    Init = 0,
    Files = 1,
    Ops = 2,
    Finalize = 3,
    Done = 4,
    Failed = 5,
}

impl RecoveryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPhase::Init => "INIT",
            RecoveryPhase::Files => "FILES",
            RecoveryPhase::Ops => "OPS",
            RecoveryPhase::Finalize => "FINALIZE",
            RecoveryPhase::Done => "DONE",
            RecoveryPhase::Failed => "FAILED",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => RecoveryPhase::Init,
            1 => RecoveryPhase::Files,
            2 => RecoveryPhase::Ops,
            3 => RecoveryPhase::Finalize,
            4 => RecoveryPhase::Done,
            _ => RecoveryPhase::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryPhase::Done | RecoveryPhase::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: RecoveryPhase) -> bool {
        use RecoveryPhase::*;
        match (self, next) {
            (Init, Files) | (Files, Ops) | (Ops, Finalize) | (Finalize, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared, lock-free view of one recovery's progress
#[derive(Debug)]
pub struct RecoveryState {
    phase: AtomicU8,
    files_total: AtomicU64,
    files_sent: AtomicU64,
    files_reused: AtomicU64,
    bytes_total: AtomicU64,
    bytes_transferred: AtomicU64,
    bytes_reused: AtomicU64,
    ops_total: AtomicU64,
    ops_recovered: AtomicU64,
    ops_skipped: AtomicU64,
    cancelled: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(RecoveryPhase::Init as u8),
            files_total: AtomicU64::new(0),
            files_sent: AtomicU64::new(0),
            files_reused: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            bytes_reused: AtomicU64::new(0),
            ops_total: AtomicU64::new(0),
            ops_recovered: AtomicU64::new(0),
            ops_skipped: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> RecoveryPhase {
        RecoveryPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Move to `next`, or fail with a protocol violation if that is illegal
    /// from the current phase.
    pub fn transition(&self, next: RecoveryPhase) -> RecoveryResult<()> {
        let mut current = self.phase();
        loop {
            if !current.can_transition_to(next) {
                return Err(RecoveryError::protocol(format!(
                    "illegal phase transition {} -> {}",
                    current, next
                ))
                .in_phase(current));
            }
            match self.phase.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = RecoveryPhase::from_u8(actual),
            }
        }
    }

    /// Require the current phase to be `expected`.
    pub fn expect_phase(&self, expected: RecoveryPhase) -> RecoveryResult<()> {
        let current = self.phase();
        if current != expected {
            return Err(RecoveryError::protocol(format!(
                "expected phase {} but recovery is in {}",
                expected, current
            ))
            .in_phase(current));
        }
        Ok(())
    }

    /// Move to FAILED and record the first failure description.
    ///
    /// Returns false when the state was already terminal.
    pub fn fail(&self, description: impl Into<String>, cancelled: bool) -> bool {
        if self.transition(RecoveryPhase::Failed).is_err() {
            return false;
        }
        if cancelled {
            self.cancelled.store(true, Ordering::Release);
        }
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        failure.get_or_insert_with(|| description.into());
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_file_totals(&self, files_total: u64, files_reused: u64, bytes_total: u64, bytes_reused: u64) {
        self.files_total.store(files_total, Ordering::Relaxed);
        self.files_reused.store(files_reused, Ordering::Relaxed);
        self.bytes_total.store(bytes_total, Ordering::Relaxed);
        self.bytes_reused.store(bytes_reused, Ordering::Relaxed);
    }

    pub fn add_file_sent(&self) {
        self.files_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_transferred(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_ops_total(&self, total: u64) {
        self.ops_total.store(total, Ordering::Relaxed);
    }

    pub fn add_ops_recovered(&self, ops: u64) {
        self.ops_recovered.fetch_add(ops, Ordering::Relaxed);
    }

    pub fn add_ops_skipped(&self, ops: u64) {
        self.ops_skipped.fetch_add(ops, Ordering::Relaxed);
    }

    pub fn ops_total(&self) -> u64 {
        self.ops_total.load(Ordering::Relaxed)
    }

    pub fn ops_recovered(&self) -> u64 {
        self.ops_recovered.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RecoveryStateSnapshot {
        RecoveryStateSnapshot {
            phase: self.phase(),
            files_total: self.files_total.load(Ordering::Relaxed),
            files_sent: self.files_sent.load(Ordering::Relaxed),
            files_reused: self.files_reused.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            bytes_reused: self.bytes_reused.load(Ordering::Relaxed),
            ops_total: self.ops_total.load(Ordering::Relaxed),
            ops_recovered: self.ops_recovered.load(Ordering::Relaxed),
            ops_skipped: self.ops_skipped.load(Ordering::Relaxed),
            cancelled: self.is_cancelled(),
            failure: self.failure(),
        }
    }
}

/// Point-in-time copy of a [`RecoveryState`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryStateSnapshot {
    pub phase: RecoveryPhase,
    pub files_total: u64,
    pub files_sent: u64,
    pub files_reused: u64,
    pub bytes_total: u64,
    pub bytes_transferred: u64,
    pub bytes_reused: u64,
    pub ops_total: u64,
    pub ops_recovered: u64,
    pub ops_skipped: u64,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}
