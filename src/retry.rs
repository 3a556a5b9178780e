//! `RetryContextStore`: accumulates the failure history for a task across
//! retries, so a retried attempt's prompt can say exactly what went wrong
//! last time instead of repeating the same failing approach blind.
//!
//! Threads a running summary of prior attempts' outcomes into the next
//! prompt.

use std::collections::HashMap;

use crate::model::VerificationResult;

/// One retry attempt's recorded outcome for a task.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub reason: String,
    pub verification: Vec<VerificationResult>,
}

/// Per-task retry history, keyed by task id.
#[derive(Debug, Default)]
pub struct RetryContextStore {
    history: HashMap<String, Vec<RetryAttempt>>,
}

impl RetryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(
        &mut self,
        task_id: &str,
        reason: impl Into<String>,
        verification: Vec<VerificationResult>,
    ) {
        let entries = self.history.entry(task_id.to_string()).or_default();
        let attempt = entries.len() as u32 + 1;
        entries.push(RetryAttempt {
            attempt,
            reason: reason.into(),
            verification,
        });
    }

    pub fn attempts_for(&self, task_id: &str) -> &[RetryAttempt] {
        self.history.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Drops a task's failure history. Called once a task fully succeeds —
    /// a later unrelated retry of the same task id should not see a stale
    /// reason from a previous, already-resolved failure.
    pub fn clear(&mut self, task_id: &str) {
        self.history.remove(task_id);
    }

    /// Renders the retry history for `task_id` into a prompt section, or
    /// an empty string if this is the task's first attempt.
    pub fn render_for_prompt(&self, task_id: &str) -> String {
        let attempts = self.attempts_for(task_id);
        if attempts.is_empty() {
            return String::new();
        }

        let mut out = String::from("Previous attempts at this task failed:\n");
        for attempt in attempts {
            out.push_str(&format!("\nAttempt {}: {}\n", attempt.attempt, attempt.reason));
            for v in &attempt.verification {
                if !v.passed {
                    out.push_str(&format!(
                        "  - {:?} failed (exit {:?}): {}\n",
                        v.criterion,
                        v.exit_code,
                        truncate(&v.output, 500)
                    ));
                }
            }
        }
        out
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{truncated}... [truncated]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CriterionType;

    #[test]
    fn first_attempt_renders_empty_prompt_section() {
        let store = RetryContextStore::new();
        assert_eq!(store.render_for_prompt("t1"), "");
    }

    #[test]
    fn records_and_renders_increasing_attempt_numbers() {
        let mut store = RetryContextStore::new();
        store.record_failure("t1", "tests failed", vec![]);
        store.record_failure("t1", "still failing", vec![]);

        let attempts = store.attempts_for("t1");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempt, 1);
        assert_eq!(attempts[1].attempt, 2);

        let rendered = store.render_for_prompt("t1");
        assert!(rendered.contains("Attempt 1: tests failed"));
        assert!(rendered.contains("Attempt 2: still failing"));
    }

    #[test]
    fn render_includes_failed_verification_output() {
        let mut store = RetryContextStore::new();
        store.record_failure(
            "t1",
            "build broke",
            vec![VerificationResult {
                criterion: CriterionType::BuildSucceeds,
                required: true,
                passed: false,
                exit_code: Some(1),
                duration_ms: 10,
                output: "error[E0432]: unresolved import".to_string(),
                command: "cargo build".to_string(),
            }],
        );
        let rendered = store.render_for_prompt("t1");
        assert!(rendered.contains("unresolved import"));
    }

    #[test]
    fn different_tasks_have_independent_histories() {
        let mut store = RetryContextStore::new();
        store.record_failure("t1", "a", vec![]);
        assert!(store.attempts_for("t2").is_empty());
    }

    #[test]
    fn clear_removes_history_for_that_task_only() {
        let mut store = RetryContextStore::new();
        store.record_failure("t1", "a", vec![]);
        store.record_failure("t2", "b", vec![]);

        store.clear("t1");

        assert!(store.attempts_for("t1").is_empty());
        assert_eq!(store.attempts_for("t2").len(), 1);
    }
}
