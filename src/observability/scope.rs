//! ObservationScope for phase begin/complete logging
//!
//! - Logs `{name}_BEGIN` on creation
//! - Logs `{name}_COMPLETE` or `{name}_FAILED` when closed
//! - Logs `{name}_INCOMPLETE` if dropped without being closed, which happens
//!   when a recovery task is aborted mid-phase

use std::time::Instant;

use super::logger::Logger;

/// A phase scope carrying the fields of its session
///
/// Owns its fields, so it can be held across `.await` points inside a
/// recovery task.
pub struct ObservationScope {
    name: &'static str,
    completed: bool,
    fields: Vec<(&'static str, String)>,
    timer: Timer,
}

impl ObservationScope {
    /// Open a scope with no fields.
    pub fn new(name: &'static str) -> Self {
        Self::with_fields(name, &[])
    }

    /// Open a scope; `fields` are repeated on every line it logs.
    pub fn with_fields(name: &'static str, fields: &[(&'static str, String)]) -> Self {
        let scope = Self {
            name,
            completed: false,
            fields: fields.to_vec(),
            timer: Timer::new(),
        };
        Logger::info(&format!("{}_BEGIN", name), &scope.field_refs());
        scope
    }

    fn field_refs(&self) -> Vec<(&str, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect()
    }

    /// Close the scope successfully.
    pub fn complete(self) {
        self.complete_with_fields(&[]);
    }

    /// Close the scope successfully, adding result fields and the elapsed time.
    pub fn complete_with_fields(mut self, extra_fields: &[(&str, &str)]) {
        self.completed = true;
        let elapsed = self.timer.elapsed_ms();
        let mut all_fields = self.field_refs();
        all_fields.extend(extra_fields.iter().copied());
        all_fields.push(("elapsed_ms", &elapsed));
        Logger::info(&format!("{}_COMPLETE", self.name), &all_fields);
    }

    /// Close the scope as failed at ERROR level.
    pub fn fail(mut self, reason: &str) {
        self.completed = true;
        let mut all_fields = self.field_refs();
        all_fields.push(("reason", reason));
        Logger::error(&format!("{}_FAILED", self.name), &all_fields);
    }

    /// Close the scope as failed at FATAL level.
    pub fn fail_fatal(mut self, reason: &str) {
        self.completed = true;
        let mut all_fields = self.field_refs();
        all_fields.push(("reason", reason));
        Logger::fatal(&format!("{}_FAILED", self.name), &all_fields);
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.completed {
            let mut all_fields = self.field_refs();
            all_fields.push(("reason", "scope dropped without completion"));
            Logger::warn(&format!("{}_INCOMPLETE", self.name), &all_fields);
        }
    }
}

/// A simple duration timer for logging elapsed time
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed milliseconds as a string
    pub fn elapsed_ms(&self) -> String {
        self.start.elapsed().as_millis().to_string()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_lifecycle() {
        let scope = ObservationScope::with_fields("RECOVERY_FILES", &[("recovery_id", "1".into())]);
        assert!(!scope.is_completed());
        scope.complete_with_fields(&[("files", "3")]);
    }

    #[test]
    fn test_scope_fail() {
        ObservationScope::new("RECOVERY_OPS").fail("sequence gap");
        ObservationScope::new("RECOVERY_OPS").fail_fatal("inconsistent segment");
    }

    #[test]
    fn test_scope_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<ObservationScope>();
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let ms: u64 = timer.elapsed_ms().parse().unwrap();
        assert!(ms >= 10);
    }
}
