//! Recovery lifecycle events
//!
//! Every line the recovery subsystem logs is named by one of these events.
//! Events are explicit and typed; the string form is the stable `event`
//! field of the JSON log line.

use std::fmt;

use super::logger::Severity;

/// Observable events of a peer recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Session lifecycle
    /// Session created, waiting for a concurrency permit
    RecoveryQueued,
    /// Session acquired its permit and started
    RecoveryStart,
    /// Session reached DONE
    RecoveryComplete,
    /// Session reached FAILED because of an error
    RecoveryFailed,
    /// Session reached FAILED because it was cancelled
    RecoveryCancelled,
    /// A newer recovery for the same shard replaced a running one
    RecoverySuperseded,

    // Phase FILES
    /// File inventory sent / received
    FilesBegin,
    /// One file fully received and verified
    FileVerified,
    /// A chunk or whole-file checksum did not match
    ChunkMismatch,
    /// All announced files received
    FilesComplete,

    // Phase OPS
    /// Operation replay begins
    OpsBegin,
    /// One batch of operations applied
    OpsBatch,
    /// Operation replay complete
    OpsComplete,

    // Phase FINALIZE
    /// Finalize begins
    FinalizeBegin,
    /// Files promoted, target is in sync
    FinalizeComplete,

    // Resolver
    /// A segment failed the identity consistency check
    InconsistentSegment,

    // Tooling
    /// Settings loaded from a file
    ConfigLoaded,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::RecoveryQueued => "RECOVERY_QUEUED",
            Event::RecoveryStart => "RECOVERY_BEGIN",
            Event::RecoveryComplete => "RECOVERY_COMPLETE",
            Event::RecoveryFailed => "RECOVERY_FAILED",
            Event::RecoveryCancelled => "RECOVERY_CANCELLED",
            Event::RecoverySuperseded => "RECOVERY_SUPERSEDED",

            Event::FilesBegin => "RECOVERY_FILES_BEGIN",
            Event::FileVerified => "RECOVERY_FILE_VERIFIED",
            Event::ChunkMismatch => "RECOVERY_CHUNK_MISMATCH",
            Event::FilesComplete => "RECOVERY_FILES_COMPLETE",

            Event::OpsBegin => "RECOVERY_OPS_BEGIN",
            Event::OpsBatch => "RECOVERY_OPS_BATCH",
            Event::OpsComplete => "RECOVERY_OPS_COMPLETE",

            Event::FinalizeBegin => "RECOVERY_FINALIZE_BEGIN",
            Event::FinalizeComplete => "RECOVERY_FINALIZE_COMPLETE",

            Event::InconsistentSegment => "SEGMENT_INCONSISTENT",

            Event::ConfigLoaded => "CONFIG_LOADED",
        }
    }

    /// Severity the event is logged at.
    pub fn severity(&self) -> Severity {
        match self {
            Event::InconsistentSegment => Severity::Fatal,
            Event::RecoveryFailed | Event::ChunkMismatch => Severity::Error,
            Event::RecoveryCancelled | Event::RecoverySuperseded => Severity::Warn,
            Event::FileVerified | Event::OpsBatch => Severity::Trace,
            _ => Severity::Info,
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
