//! Structured-text protocol parsing: the tolerant extraction layer that
//! turns an agent's free-form stdout into typed signals.
//!
//! Agents are expected to emit one of a small number of markers somewhere
//! in their final message:
//!
//! - `<progress>...</progress>` — a one-line status update, logged but not
//!   otherwise acted on.
//! - `<blocker>...</blocker>` — the agent cannot proceed without human
//!   input; the enclosing phase runner enqueues a human-queue entry.
//! - `===TASK COMPLETE===` followed by a fenced ` ```json ` block — the
//!   agent's structured result payload for the current phase.
//! - `===HANDOFF===` followed by a fenced ` ```json ` block — a
//!   [`ContinuationBlock`](crate::model::ContinuationBlock), emitted when
//!   `ContextWatcher` has told the agent to hand off.
//!
//! Real agent output is messy: markdown fences vary, prose wraps the JSON,
//! and occasionally the marker line itself is echoed back inside the JSON
//! string. Every extraction here tries the strict path first and falls back
//! to brace-counting via [`crate::util::extract_json_object`].

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::errors::ProtocolError;
use crate::model::ContinuationBlock;
use crate::util::extract_json_object;

static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<progress>(.*?)</progress>").expect("valid regex"));

static BLOCKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<blocker>(.*?)</blocker>").expect("valid regex"));

static LEARNINGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<learnings>(.*?)</learnings>").expect("valid regex"));

static COMPLETE_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)=+\s*task\s+complete\s*=+").expect("valid regex"));

static HANDOFF_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)=+\s*handoff\s*=+").expect("valid regex"));

static FENCED_JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex"));

/// A non-fatal status line the agent chose to surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub message: String,
}

/// Raw wire shape of a task-completion payload, before being folded into
/// the caller's domain type (each [`crate::phases`] module deserializes
/// into its own phase-specific struct via [`ProtocolParser::extract_json`]).
#[derive(Debug, Deserialize)]
pub struct RawContinuation {
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_to_touch: Vec<String>,
    #[serde(default)]
    pub current_state: String,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub context: String,
}

/// Stateless parser over one agent turn's raw stdout text.
pub struct ProtocolParser;

impl ProtocolParser {
    /// Extracts the first `<progress>` tag's contents, if present.
    pub fn progress(text: &str) -> Option<ProgressUpdate> {
        PROGRESS_RE.captures(text).map(|c| ProgressUpdate {
            message: c[1].trim().to_string(),
        })
    }

    /// Extracts the first `<blocker>` tag's contents, if present.
    pub fn blocker(text: &str) -> Option<String> {
        BLOCKER_RE.captures(text).map(|c| c[1].trim().to_string())
    }

    /// Extracts the first `<learnings>` tag's contents, if present — a
    /// developer agent's notes worth carrying into the memory store once
    /// its task fully succeeds.
    pub fn learnings(text: &str) -> Option<String> {
        LEARNINGS_RE.captures(text).map(|c| c[1].trim().to_string())
    }

    pub fn has_completion_marker(text: &str) -> bool {
        COMPLETE_MARKER_RE.is_match(text)
    }

    pub fn has_handoff_marker(text: &str) -> bool {
        HANDOFF_MARKER_RE.is_match(text)
    }

    /// Pulls the JSON payload out of `text` and deserializes it as `T`.
    ///
    /// Tries, in order: the fenced ` ```json ` block nearest the marker
    /// regex (if `after` is given, only fences after that marker's end are
    /// considered), then any fenced block, then brace-counting over the
    /// whole text.
    pub fn extract_json<T: serde::de::DeserializeOwned>(
        text: &str,
        after: Option<&Regex>,
    ) -> Result<T, ProtocolError> {
        let search_from = after
            .and_then(|re| re.find(text))
            .map(|m| m.end())
            .unwrap_or(0);
        let tail = &text[search_from..];

        let candidate = FENCED_JSON_RE
            .captures(tail)
            .map(|c| c[1].to_string())
            .or_else(|| extract_json_object(tail))
            .or_else(|| extract_json_object(text))
            .ok_or(ProtocolError::NoJsonFound)?;

        serde_json::from_str(&candidate).map_err(ProtocolError::from)
    }

    /// Parses a `===HANDOFF===` fenced JSON block into a
    /// [`ContinuationBlock`]. Returns a `minimal` block (identity-only) if
    /// no JSON payload could be found at all — a handoff must always
    /// produce *something*, even if the agent's output was truncated by a
    /// timeout.
    pub fn parse_continuation(text: &str) -> ContinuationBlock {
        match Self::extract_json::<RawContinuation>(text, Some(&HANDOFF_MARKER_RE)) {
            Ok(raw) => ContinuationBlock {
                files_modified: raw.files_modified,
                files_to_touch: raw.files_to_touch,
                current_state: raw.current_state,
                blockers: raw.blockers,
                next_steps: raw.next_steps,
                context: raw.context,
                minimal: false,
            },
            Err(_) => ContinuationBlock {
                minimal: true,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_progress_tag() {
        let text = "some preamble\n<progress>implementing the parser</progress>\nmore text";
        let progress = ProtocolParser::progress(text).unwrap();
        assert_eq!(progress.message, "implementing the parser");
    }

    #[test]
    fn extracts_blocker_tag() {
        let text = "<blocker>need API credentials to proceed</blocker>";
        assert_eq!(
            ProtocolParser::blocker(text).unwrap(),
            "need API credentials to proceed"
        );
    }

    #[test]
    fn no_blocker_tag_returns_none() {
        assert!(ProtocolParser::blocker("nothing to see here").is_none());
    }

    #[test]
    fn extracts_learnings_tag() {
        let text = "done.\n<learnings>the retry helper needs a tokio runtime</learnings>";
        assert_eq!(
            ProtocolParser::learnings(text).unwrap(),
            "the retry helper needs a tokio runtime"
        );
    }

    #[test]
    fn no_learnings_tag_returns_none() {
        assert!(ProtocolParser::learnings("nothing to see here").is_none());
    }

    #[test]
    fn detects_completion_marker_case_insensitively() {
        assert!(ProtocolParser::has_completion_marker("=== TASK COMPLETE ==="));
        assert!(ProtocolParser::has_completion_marker("===task complete==="));
        assert!(!ProtocolParser::has_completion_marker("still working"));
    }

    #[test]
    fn extracts_fenced_json_after_completion_marker() {
        let text = r#"
I finished the task.

=== TASK COMPLETE ===

```json
{"files_modified": ["src/main.rs"], "current_state": "done", "context": "", "files_to_touch": [], "blockers": [], "next_steps": []}
```
"#;
        let raw: RawContinuation =
            ProtocolParser::extract_json(text, Some(&COMPLETE_MARKER_RE)).unwrap();
        assert_eq!(raw.files_modified, vec!["src/main.rs"]);
        assert_eq!(raw.current_state, "done");
    }

    #[test]
    fn parse_continuation_falls_back_to_minimal_on_missing_json() {
        let block = ProtocolParser::parse_continuation("I ran out of context mid-sentence and");
        assert!(block.minimal);
    }

    #[test]
    fn parse_continuation_extracts_full_block() {
        let text = r#"===HANDOFF===
```json
{
  "files_modified": ["src/a.rs", "src/b.rs"],
  "files_to_touch": ["src/c.rs"],
  "current_state": "refactor half done",
  "blockers": [],
  "next_steps": ["finish c.rs"],
  "context": "extracted helper into b.rs"
}
```"#;
        let block = ProtocolParser::parse_continuation(text);
        assert!(!block.minimal);
        assert_eq!(block.files_modified, vec!["src/a.rs", "src/b.rs"]);
        assert_eq!(block.next_steps, vec!["finish c.rs"]);
    }

    #[test]
    fn extract_json_tolerates_prose_without_fences() {
        let text = r#"Here's my result: {"files_modified": [], "files_to_touch": [], "current_state": "ok", "blockers": [], "next_steps": [], "context": "x"} -- done"#;
        let raw: RawContinuation = ProtocolParser::extract_json(text, None).unwrap();
        assert_eq!(raw.current_state, "ok");
    }
}
