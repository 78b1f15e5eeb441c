//! Recovery error types
//!
//! Error codes:
//! - RECOVERY_TRANSPORT (ERROR)
//! - RECOVERY_TIMEOUT (ERROR)
//! - RECOVERY_CHECKSUM_MISMATCH (ERROR)
//! - RECOVERY_INCONSISTENT_SEGMENT (FATAL)
//! - RECOVERY_SEQUENCE_GAP (ERROR)
//! - RECOVERY_PROTOCOL_VIOLATION (ERROR)
//! - RECOVERY_STORAGE (ERROR)
//! - RECOVERY_CANCELLED (WARN)
//!
//! No kind is retried inside the subsystem. Every error that leaves a
//! session carries its recovery id, shard and phase.

use std::fmt;

use super::state::RecoveryPhase;
use crate::engine::EngineError;
use crate::observability::Severity;
use crate::shard::ShardId;
use crate::store::StoreError;
use crate::stream::CodecError;
use crate::translog::TranslogError;
use crate::uid::UidError;

/// Recovery error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryErrorKind {
    /// Request could not be delivered or its response was unusable
    Transport,
    /// Request exceeded its per-request timeout
    Timeout,
    /// Chunk or whole-file checksum did not match the announced value
    ChecksumMismatch,
    /// A segment's identity data contradicts itself
    InconsistentSegment,
    /// An operation arrived or was read out of sequence
    SequenceGap,
    /// Peer sent something the protocol does not allow here
    ProtocolViolation,
    /// Store, translog or engine failed
    Storage,
    /// Session was cancelled
    Cancelled,
}

impl RecoveryErrorKind {
    const ALL: [RecoveryErrorKind; 8] = [
        RecoveryErrorKind::Transport,
        RecoveryErrorKind::Timeout,
        RecoveryErrorKind::ChecksumMismatch,
        RecoveryErrorKind::InconsistentSegment,
        RecoveryErrorKind::SequenceGap,
        RecoveryErrorKind::ProtocolViolation,
        RecoveryErrorKind::Storage,
        RecoveryErrorKind::Cancelled,
    ];

    /// Stable string code, also used on the wire in failure responses
    pub fn code(&self) -> &'static str {
        match self {
            RecoveryErrorKind::Transport => "RECOVERY_TRANSPORT",
            RecoveryErrorKind::Timeout => "RECOVERY_TIMEOUT",
            RecoveryErrorKind::ChecksumMismatch => "RECOVERY_CHECKSUM_MISMATCH",
            RecoveryErrorKind::InconsistentSegment => "RECOVERY_INCONSISTENT_SEGMENT",
            RecoveryErrorKind::SequenceGap => "RECOVERY_SEQUENCE_GAP",
            RecoveryErrorKind::ProtocolViolation => "RECOVERY_PROTOCOL_VIOLATION",
            RecoveryErrorKind::Storage => "RECOVERY_STORAGE",
            RecoveryErrorKind::Cancelled => "RECOVERY_CANCELLED",
        }
    }

    /// Inverse of [`RecoveryErrorKind::code`]
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub fn severity(&self) -> Severity {
        match self {
            RecoveryErrorKind::InconsistentSegment => Severity::Fatal,
            RecoveryErrorKind::Cancelled => Severity::Warn,
            _ => Severity::Error,
        }
    }

    /// Fatal kinds need operator attention before the shard is used again.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for RecoveryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Recovery error with session context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryError {
    kind: RecoveryErrorKind,
    message: String,
    recovery_id: Option<i64>,
    shard_id: Option<ShardId>,
    phase: Option<RecoveryPhase>,
}

impl RecoveryError {
    pub fn new(kind: RecoveryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recovery_id: None,
            shard_id: None,
            phase: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(RecoveryErrorKind::Transport, message)
    }

    pub fn timeout(action: &str, timeout_ms: u64) -> Self {
        Self::new(
            RecoveryErrorKind::Timeout,
            format!("{} timed out after {}ms", action, timeout_ms),
        )
    }

    pub fn checksum_mismatch(message: impl Into<String>) -> Self {
        Self::new(RecoveryErrorKind::ChecksumMismatch, message)
    }

    pub fn inconsistent_segment(message: impl Into<String>) -> Self {
        Self::new(RecoveryErrorKind::InconsistentSegment, message)
    }

    pub fn sequence_gap(expected: i64, actual: i64) -> Self {
        Self::new(
            RecoveryErrorKind::SequenceGap,
            format!("expected seq_no [{}] but got [{}]", expected, actual),
        )
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(RecoveryErrorKind::ProtocolViolation, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(RecoveryErrorKind::Storage, message)
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(RecoveryErrorKind::Cancelled, reason)
    }

    /// Attach session identity; fields already set are kept.
    pub fn with_context(mut self, recovery_id: i64, shard_id: &ShardId) -> Self {
        self.recovery_id.get_or_insert(recovery_id);
        if self.shard_id.is_none() {
            self.shard_id = Some(shard_id.clone());
        }
        self
    }

    /// Attach the phase the failure happened in, unless one is set.
    pub fn in_phase(mut self, phase: RecoveryPhase) -> Self {
        self.phase.get_or_insert(phase);
        self
    }

    pub fn kind(&self) -> RecoveryErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn recovery_id(&self) -> Option<i64> {
        self.recovery_id
    }

    pub fn shard_id(&self) -> Option<&ShardId> {
        self.shard_id.as_ref()
    }

    pub fn phase(&self) -> Option<RecoveryPhase> {
        self.phase
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == RecoveryErrorKind::Cancelled
    }
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.severity(), self.kind.code())?;
        if let Some(id) = self.recovery_id {
            write!(f, " recovery [{}]", id)?;
        }
        if let Some(shard) = &self.shard_id {
            write!(f, " shard {}", shard)?;
        }
        if let Some(phase) = self.phase {
            write!(f, " phase [{}]", phase)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for RecoveryError {}

impl From<StoreError> for RecoveryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ChecksumMismatch { .. } => RecoveryError::checksum_mismatch(err.to_string()),
            other => RecoveryError::storage(other.to_string()),
        }
    }
}

impl From<TranslogError> for RecoveryError {
    fn from(err: TranslogError) -> Self {
        RecoveryError::storage(err.to_string())
    }
}

impl From<UidError> for RecoveryError {
    fn from(err: UidError) -> Self {
        if err.is_fatal() {
            RecoveryError::inconsistent_segment(err.to_string())
        } else {
            RecoveryError::storage(err.to_string())
        }
    }
}

impl From<EngineError> for RecoveryError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Uid(uid) => uid.into(),
            other => RecoveryError::storage(other.to_string()),
        }
    }
}

impl From<CodecError> for RecoveryError {
    fn from(err: CodecError) -> Self {
        RecoveryError::transport(format!("malformed message: {}", err))
    }
}

/// Result type for recovery operations
pub type RecoveryResult<T> = Result<T, RecoveryError>;
