//! `HandoffStore`: records every handoff to disk and exposes the most
//! recent one for the replacement agent's opening prompt.
//!
//! An append-only JSON Lines trail, one record per event, with explicit
//! error propagation.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::errors::StateError;
use crate::model::{ContinuationBlock, Handoff};

/// SHA-256 of a continuation block's canonical JSON form, hex-encoded.
/// Used both to stamp a handoff as it's written and to detect a record
/// whose `content_hash` no longer matches its body (truncated write,
/// hand-edited file).
pub fn hash_continuation(block: &ContinuationBlock) -> String {
    let bytes = serde_json::to_vec(block).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{digest:x}")
}

pub struct HandoffStore {
    path: PathBuf,
}

impl HandoffStore {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            path: working_dir.join(".autonoma").join("handoffs.jsonl"),
        }
    }

    /// Appends one handoff record. Never truncates or rewrites prior
    /// records — the file is the full audit trail for the run.
    pub fn record(&self, handoff: &Handoff) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let line = serde_json::to_string(handoff).map_err(|source| StateError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| StateError::Write {
                path: self.path.display().to_string(),
                source,
            })?;

        writeln!(file, "{line}").map_err(|source| StateError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Reads the full handoff history in file order.
    pub fn read_all(&self) -> Result<Vec<Handoff>, StateError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path).map_err(|source| StateError::Read {
            path: self.path.display().to_string(),
            source,
        })?;

        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| StateError::Parse {
                    path: self.path.display().to_string(),
                    source,
                })
            })
            .collect()
    }

    /// The most recent handoff for a given predecessor role, if any —
    /// used to seed a replacement agent's opening prompt with the
    /// continuation block.
    pub fn latest_for_role(&self, role: crate::model::Role) -> Result<Option<Handoff>, StateError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|h| h.role == role)
            .max_by_key(|h| h.timestamp))
    }

    /// The handoff whose `replacement_agent_id` is `replacement_id` — used
    /// to find a specific successor's continuation block rather than
    /// guessing from `latest_for_role`, which is ambiguous whenever more
    /// than one Developer handoff is in flight for the same role at once.
    pub fn for_replacement(&self, replacement_id: &str) -> Result<Option<Handoff>, StateError> {
        Ok(self
            .read_all()?
            .into_iter()
            .find(|h| h.replacement_agent_id.as_deref() == Some(replacement_id)))
    }

    /// Backfills `replacement_agent_id` on the most recent handoff recorded
    /// for `predecessor_id`. The replacement agent's id isn't known until
    /// after `AgentRegistry::replace` runs, which happens after the handoff
    /// record itself is written — so this rewrites the file in place rather
    /// than appending, the one exception to the store's append-only rule.
    pub fn backfill_replacement(
        &self,
        predecessor_id: &str,
        replacement_id: &str,
    ) -> Result<(), StateError> {
        let mut records = self.read_all()?;
        let target = records
            .iter_mut()
            .filter(|h| h.predecessor_id == predecessor_id)
            .max_by_key(|h| h.timestamp);

        let Some(handoff) = target else {
            return Ok(());
        };
        handoff.replacement_agent_id = Some(replacement_id.to_string());

        let mut text = String::new();
        for record in &records {
            let line = serde_json::to_string(record).map_err(|source| StateError::Parse {
                path: self.path.display().to_string(),
                source,
            })?;
            text.push_str(&line);
            text.push('\n');
        }

        let tmp_path = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp_path, text).map_err(|source| StateError::Write {
            path: tmp_path.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| StateError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Re-hashes every record's continuation block and compares it against
    /// the stamp written alongside it, returning the predecessor ids of any
    /// records whose body no longer matches — a hand-edited or
    /// partially-recovered `handoffs.jsonl` line, surfaced rather than
    /// silently trusted.
    pub fn verify_integrity(&self) -> Result<Vec<String>, StateError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|h| h.content_hash != hash_continuation(&h.continuation))
            .map(|h| h.predecessor_id)
            .collect())
    }
}

/// Renders a [`Handoff`]'s continuation block into the opening prompt
/// section a replacement agent reads before anything else.
pub fn render_continuation_prompt(handoff: &Handoff) -> String {
    let c = &handoff.continuation;
    if c.minimal {
        return format!(
            "You are replacing {} ({}), which handed off without a structured continuation \
             (its output was likely truncated). Re-derive current state from the working \
             directory and recent git history before proceeding.",
            handoff.predecessor_id, handoff.role
        );
    }

    let mut out = format!(
        "You are replacing {} ({}) mid-task via a context-budget handoff.\n\n\
         Current state: {}\n",
        handoff.predecessor_id, handoff.role, c.current_state
    );
    if !c.files_modified.is_empty() {
        out.push_str(&format!("Files modified so far: {}\n", c.files_modified.join(", ")));
    }
    if !c.files_to_touch.is_empty() {
        out.push_str(&format!("Files still to touch: {}\n", c.files_to_touch.join(", ")));
    }
    if !c.next_steps.is_empty() {
        out.push_str(&format!("Next steps:\n- {}\n", c.next_steps.join("\n- ")));
    }
    if !c.blockers.is_empty() {
        out.push_str(&format!("Known blockers:\n- {}\n", c.blockers.join("\n- ")));
    }
    if !c.context.is_empty() {
        out.push_str(&format!("\nAdditional context: {}\n", c.context));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContinuationBlock, Role, TokenUsage};
    use chrono::Utc;

    fn sample_handoff(role: Role, predecessor: &str) -> Handoff {
        let continuation = ContinuationBlock {
            files_modified: vec!["src/lib.rs".into()],
            files_to_touch: vec![],
            current_state: "halfway through parser".into(),
            blockers: vec![],
            next_steps: vec!["finish parser".into()],
            context: String::new(),
            minimal: false,
        };
        let content_hash = hash_continuation(&continuation);
        Handoff {
            predecessor_id: predecessor.to_string(),
            role,
            current_task_id: Some("t1".into()),
            timestamp: Utc::now(),
            final_token_usage: TokenUsage::default(),
            continuation,
            replacement_agent_id: None,
            content_hash,
        }
    }

    #[test]
    fn record_then_read_all_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = HandoffStore::new(dir.path());
        let handoff = sample_handoff(Role::Developer, "dev-1");
        store.record(&handoff).unwrap();

        let all = store.read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].predecessor_id, "dev-1");
    }

    #[test]
    fn latest_for_role_picks_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = HandoffStore::new(dir.path());
        store.record(&sample_handoff(Role::Developer, "dev-1")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.record(&sample_handoff(Role::Developer, "dev-2")).unwrap();
        store.record(&sample_handoff(Role::Staff, "staff-1")).unwrap();

        let latest = store.latest_for_role(Role::Developer).unwrap().unwrap();
        assert_eq!(latest.predecessor_id, "dev-2");
    }

    #[test]
    fn backfill_replacement_updates_the_matching_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = HandoffStore::new(dir.path());
        store.record(&sample_handoff(Role::Developer, "dev-1")).unwrap();

        store.backfill_replacement("dev-1", "dev-2").unwrap();

        let all = store.read_all().unwrap();
        assert_eq!(all[0].replacement_agent_id.as_deref(), Some("dev-2"));
    }

    #[test]
    fn for_replacement_finds_the_handoff_naming_that_successor() {
        let dir = tempfile::tempdir().unwrap();
        let store = HandoffStore::new(dir.path());
        store.record(&sample_handoff(Role::Developer, "dev-1")).unwrap();
        store.record(&sample_handoff(Role::Developer, "dev-2")).unwrap();
        store.backfill_replacement("dev-1", "dev-3").unwrap();

        let found = store.for_replacement("dev-3").unwrap().unwrap();
        assert_eq!(found.predecessor_id, "dev-1");
        assert!(store.for_replacement("dev-2").unwrap().is_none());
    }

    #[test]
    fn backfill_replacement_for_unknown_predecessor_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = HandoffStore::new(dir.path());
        store.record(&sample_handoff(Role::Developer, "dev-1")).unwrap();

        store.backfill_replacement("nonexistent", "dev-2").unwrap();

        let all = store.read_all().unwrap();
        assert_eq!(all[0].replacement_agent_id, None);
    }

    #[test]
    fn render_minimal_handoff_prompt_mentions_predecessor() {
        let mut handoff = sample_handoff(Role::Staff, "staff-1");
        handoff.continuation = ContinuationBlock {
            minimal: true,
            ..Default::default()
        };
        let prompt = render_continuation_prompt(&handoff);
        assert!(prompt.contains("staff-1"));
        assert!(prompt.contains("truncated"));
    }
}
