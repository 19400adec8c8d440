//! Process-wide failure bookkeeping used as a per-document circuit breaker.
//!
//! State lives in memory only and resets when the worker process restarts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::error;

use super::classify::{BoxError, ErrorDomain, ErrorKind, StageError, classify};

/// History grows to this many entries before being trimmed.
const HISTORY_LIMIT: usize = 1000;
/// Entries kept after a trim (the most recent ones).
const HISTORY_TRIM_TO: usize = 500;
/// Window used when summarizing failures by kind.
const SUMMARY_WINDOW: usize = 100;

/// One recorded failure
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub task_id: String,
    pub error_kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate view returned by [`ErrorTracker::summary`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorSummary {
    /// Failures in the retained history
    pub total_errors: usize,
    /// Counts by kind over the most recent history entries
    pub error_kinds: HashMap<ErrorKind, usize>,
    pub tasks_with_errors: usize,
}

#[derive(Default)]
struct TrackerState {
    counts: HashMap<String, u32>,
    history: VecDeque<ErrorEntry>,
}

/// Rolling failure record keyed by logical task (document) id.
#[derive(Default)]
pub struct ErrorTracker {
    state: Mutex<TrackerState>,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count a failure against `task_id` and append it to the history.
    pub fn record(&self, task_id: &str, error: &StageError) {
        let mut state = self.state();
        *state.counts.entry(task_id.to_string()).or_insert(0) += 1;
        state.history.push_back(ErrorEntry {
            task_id: task_id.to_string(),
            error_kind: error.kind,
            message: error.message.clone(),
            timestamp: Utc::now(),
        });

        if state.history.len() > HISTORY_LIMIT {
            let excess = state.history.len() - HISTORY_TRIM_TO;
            state.history.drain(..excess);
        }
    }

    pub fn error_count(&self, task_id: &str) -> u32 {
        self.state().counts.get(task_id).copied().unwrap_or(0)
    }

    /// True once `task_id` has at least `threshold` recorded failures.
    pub fn should_skip(&self, task_id: &str, threshold: u32) -> bool {
        self.error_count(task_id) >= threshold
    }

    /// Forget the per-task counter (history entries are kept).
    pub fn clear(&self, task_id: &str) {
        self.state().counts.remove(task_id);
    }

    pub fn summary(&self) -> ErrorSummary {
        let state = self.state();
        let mut error_kinds = HashMap::new();
        for entry in state.history.iter().rev().take(SUMMARY_WINDOW) {
            *error_kinds.entry(entry.error_kind).or_insert(0) += 1;
        }

        ErrorSummary {
            total_errors: state.history.len(),
            error_kinds,
            tasks_with_errors: state.counts.len(),
        }
    }

    /// Snapshot of the retained history, oldest first.
    #[cfg(test)]
    pub fn history(&self) -> Vec<ErrorEntry> {
        self.state().history.iter().cloned().collect()
    }

    /// Classify a failure that escaped its stage, record it, and log it.
    ///
    /// Failures that are already classified keep their verdict.
    pub fn log_and_handle(
        &self,
        task_id: &str,
        error: BoxError,
        domain: Option<ErrorDomain>,
        context: &str,
    ) -> StageError {
        let classified = classify(error, domain);
        self.record(task_id, &classified);
        error!(
            task_id = %task_id,
            context,
            kind = %classified.kind,
            retryable = classified.retryable,
            count = self.error_count(task_id),
            error = %classified,
            "Task failure recorded"
        );
        classified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: ErrorKind) -> StageError {
        StageError::retryable(kind, "boom")
    }

    #[test]
    fn test_should_skip_threshold() {
        let tracker = ErrorTracker::new();
        for count in 0..5 {
            assert_eq!(tracker.error_count("doc"), count);
            assert!(!tracker.should_skip("doc", 5), "skipped at {count}");
            tracker.record("doc", &failure(ErrorKind::Network));
        }
        assert!(tracker.should_skip("doc", 5));
        tracker.record("doc", &failure(ErrorKind::Network));
        assert!(tracker.should_skip("doc", 5));
        assert!(!tracker.should_skip("other", 5));
    }

    #[test]
    fn test_history_trimmed_to_most_recent() {
        let tracker = ErrorTracker::new();
        for i in 0..1001 {
            tracker.record(&format!("task-{i}"), &failure(ErrorKind::Database));
        }

        let history = tracker.history();
        assert_eq!(history.len(), 500);
        assert_eq!(history.first().unwrap().task_id, "task-501");
        assert_eq!(history.last().unwrap().task_id, "task-1000");

        // per-task counters are not trimmed with the history
        assert_eq!(tracker.summary().tasks_with_errors, 1001);
        assert_eq!(tracker.summary().total_errors, 500);
    }

    #[test]
    fn test_history_not_trimmed_at_limit() {
        let tracker = ErrorTracker::new();
        for _ in 0..1000 {
            tracker.record("t", &failure(ErrorKind::File));
        }
        assert_eq!(tracker.history().len(), 1000);
        assert_eq!(tracker.summary().total_errors, 1000);
    }

    #[test]
    fn test_summary_counts_recent_kinds() {
        let tracker = ErrorTracker::new();
        for _ in 0..150 {
            tracker.record("a", &failure(ErrorKind::Parsing));
        }
        for _ in 0..60 {
            tracker.record("b", &failure(ErrorKind::Network));
        }

        let summary = tracker.summary();
        assert_eq!(summary.total_errors, 210);
        assert_eq!(summary.tasks_with_errors, 2);
        assert_eq!(summary.error_kinds.get(&ErrorKind::Network), Some(&60));
        assert_eq!(summary.error_kinds.get(&ErrorKind::Parsing), Some(&40));
    }

    #[test]
    fn test_clear_resets_counter() {
        let tracker = ErrorTracker::new();
        tracker.record("doc", &failure(ErrorKind::Unknown));
        tracker.clear("doc");
        assert_eq!(tracker.error_count("doc"), 0);
        assert_eq!(tracker.history().len(), 1);
    }

    #[test]
    fn test_log_and_handle_keeps_typed_verdict() {
        let tracker = ErrorTracker::new();
        let typed = StageError::non_retryable(ErrorKind::Network, "timeout");
        let handled = tracker.log_and_handle("doc", Box::new(typed), None, "embedding");
        assert_eq!(handled.kind, ErrorKind::Network);
        assert!(!handled.retryable);
        assert_eq!(tracker.error_count("doc"), 1);

        let handled = tracker.log_and_handle(
            "doc",
            "mystery".into(),
            Some(ErrorDomain::Parsing),
            "parsing",
        );
        assert_eq!(handled.kind, ErrorKind::Unknown);
        assert_eq!(tracker.error_count("doc"), 2);
    }
}
