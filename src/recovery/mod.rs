//! Peer recovery
//!
//! Brings a replica shard copy up to date from a source copy on another
//! node, in strictly ordered phases:
//!
//! 1. INIT: the target describes its files and its next needed sequence
//!    number in a [`StartRecoveryRequest`]
//! 2. FILES: the source sends every file the target lacks, in checksummed
//!    chunks, and the target stages them under temporary names
//! 3. OPS: the source replays its operation history from the starting
//!    sequence number, in order, and the target applies each at most once
//! 4. FINALIZE: the target promotes the staged files and reports its local
//!    checkpoint
//!
//! Any failure moves the session to FAILED; a failed session is never
//! retried internally. Partial state is confined to temporary files, which
//! are deleted on failure or cancellation.

mod config;
mod errors;
mod inventory;
mod manager;
mod messages;
mod session;
mod source;
mod state;
mod target;
mod target_service;
mod transport;

pub use config::{RecoverySettings, SettingsError};
pub use errors::{RecoveryError, RecoveryErrorKind, RecoveryResult};
pub use inventory::{diff, FileInventory};
pub use manager::{RecoveryHandle, RecoveryManager};
pub use messages::{
    CancelRequest, FileChunkRequest, FilesCompleteRequest, FilesInfoRequest, FinalizeRequest,
    RecoveryRequest, RecoveryResponse, StartRecoveryRequest, TranslogOpsRequest,
};
pub use session::{CancellationToken, RecoverySession};
pub use source::{RecoverySource, RecoverySourceHandler};
pub use state::{RecoveryPhase, RecoveryState, RecoveryStateSnapshot};
pub use target::{load_segments, RecoveryTarget, SharedEngine};
pub use target_service::{next_recovery_id, RecoveryTargetService};
pub use transport::{LocalTransport, RecoveryTransport};
