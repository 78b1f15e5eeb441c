//! Observability for peer recovery
//!
//! - Structured logging (one JSON line per event)
//! - Node-wide recovery counters
//! - Typed lifecycle events
//! - Phase scopes with begin/complete/failed lines
//!
//! # Principles
//!
//! 1. Observability is read-only and never changes recovery behavior
//! 2. Logging failures are swallowed
//! 3. Deterministic output: fixed key order
//!
//! # Usage
//!
//! ```ignore
//! use peerrecovery::observability::{Event, Logger, MetricsRegistry, ObservationScope};
//!
//! Logger::event(Event::RecoveryStart, &[("recovery_id", "3")]);
//!
//! let metrics = MetricsRegistry::new();
//! metrics.add_bytes_sent(4096);
//!
//! let scope = ObservationScope::new("RECOVERY_FILES");
//! // ... transfer files ...
//! scope.complete();
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_logs_at_its_severity() {
        let line = Logger::render(
            Event::ChunkMismatch.severity(),
            Event::ChunkMismatch.as_str(),
            &[("file", "_0.seg")],
        );
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["event"], "RECOVERY_CHUNK_MISMATCH");
        assert_eq!(parsed["severity"], "ERROR");
    }

    #[test]
    fn test_event_does_not_panic() {
        Logger::event(Event::ConfigLoaded, &[("path", "/tmp/settings.json")]);
    }
}
