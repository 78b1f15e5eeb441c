//! Recovery metrics registry
//!
//! - Counters only, monotonic, reset only on process start
//! - Thread-safe, lock-free; one registry is shared by every session on a node

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Node-wide recovery counters
///
/// All counters use Relaxed atomics; readers see a consistent value per
/// counter but not across counters.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    recoveries_started: AtomicU64,
    recoveries_completed: AtomicU64,
    recoveries_failed: AtomicU64,
    recoveries_cancelled: AtomicU64,
    files_sent: AtomicU64,
    files_reused: AtomicU64,
    bytes_sent: AtomicU64,
    ops_replayed: AtomicU64,
    ops_skipped: AtomicU64,
    chunk_mismatches: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Session lifecycle

    pub fn increment_recoveries_started(&self) {
        self.recoveries_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_recoveries_completed(&self) {
        self.recoveries_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_recoveries_failed(&self) {
        self.recoveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_recoveries_cancelled(&self) {
        self.recoveries_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    // Phase FILES

    pub fn add_files_sent(&self, files: u64) {
        self.files_sent.fetch_add(files, Ordering::Relaxed);
    }

    pub fn add_files_reused(&self, files: u64) {
        self.files_reused.fetch_add(files, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_chunk_mismatches(&self) {
        self.chunk_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    // Phase OPS

    pub fn add_ops_replayed(&self, ops: u64) {
        self.ops_replayed.fetch_add(ops, Ordering::Relaxed);
    }

    pub fn add_ops_skipped(&self, ops: u64) {
        self.ops_skipped.fetch_add(ops, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            recoveries_started: self.recoveries_started.load(Ordering::Relaxed),
            recoveries_completed: self.recoveries_completed.load(Ordering::Relaxed),
            recoveries_failed: self.recoveries_failed.load(Ordering::Relaxed),
            recoveries_cancelled: self.recoveries_cancelled.load(Ordering::Relaxed),
            files_sent: self.files_sent.load(Ordering::Relaxed),
            files_reused: self.files_reused.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            ops_replayed: self.ops_replayed.load(Ordering::Relaxed),
            ops_skipped: self.ops_skipped.load(Ordering::Relaxed),
            chunk_mismatches: self.chunk_mismatches.load(Ordering::Relaxed),
        }
    }

    /// Current values as a JSON object.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub recoveries_started: u64,
    pub recoveries_completed: u64,
    pub recoveries_failed: u64,
    pub recoveries_cancelled: u64,
    pub files_sent: u64,
    pub files_reused: u64,
    pub bytes_sent: u64,
    pub ops_replayed: u64,
    pub ops_skipped: u64,
    pub chunk_mismatches: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_zero_values() {
        let snapshot = MetricsRegistry::new().snapshot();
        assert_eq!(snapshot.recoveries_started, 0);
        assert_eq!(snapshot.bytes_sent, 0);
        assert_eq!(snapshot.ops_replayed, 0);
    }

    #[test]
    fn test_increment_counters() {
        let registry = MetricsRegistry::new();
        registry.increment_recoveries_started();
        registry.increment_recoveries_started();
        registry.increment_recoveries_completed();
        registry.increment_recoveries_failed();
        registry.increment_recoveries_cancelled();
        registry.add_files_sent(3);
        registry.add_files_reused(2);
        registry.add_bytes_sent(4096);
        registry.add_ops_replayed(30);
        registry.add_ops_skipped(7);
        registry.increment_chunk_mismatches();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.recoveries_started, 2);
        assert_eq!(snapshot.recoveries_completed, 1);
        assert_eq!(snapshot.recoveries_failed, 1);
        assert_eq!(snapshot.recoveries_cancelled, 1);
        assert_eq!(snapshot.files_sent, 3);
        assert_eq!(snapshot.files_reused, 2);
        assert_eq!(snapshot.bytes_sent, 4096);
        assert_eq!(snapshot.ops_replayed, 30);
        assert_eq!(snapshot.ops_skipped, 7);
        assert_eq!(snapshot.chunk_mismatches, 1);
    }

    #[test]
    fn test_to_json() {
        let registry = MetricsRegistry::new();
        registry.add_bytes_sent(1234);
        registry.add_ops_skipped(1);

        let parsed: serde_json::Value = serde_json::from_str(&registry.to_json()).unwrap();
        assert_eq!(parsed["bytes_sent"], 1234);
        assert_eq!(parsed["ops_skipped"], 1);
    }

    #[test]
    fn test_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(MetricsRegistry::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let reg = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    reg.add_bytes_sent(2);
                    reg.add_ops_replayed(1);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.bytes_sent, 2000);
        assert_eq!(snapshot.ops_replayed, 1000);
    }
}
