//! Durable state persistence: versioned, migrating, atomically-written
//! `state.json`.
//!
//! Atomic read/write with explicit error propagation and no silent
//! swallowing, owned by a single struct responsible for the state file's
//! lifecycle. Locking is done with `fs2` advisory file locks so two
//! `autonoma` processes never interleave writes to the same `state.json`.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde_json::Value;

use crate::errors::StateError;
use crate::model::{PersistedState, Phase, STATE_VERSION};

mod migrations;

/// Sentinel written into `requirements_path` by [`migrations`] when an old
/// state embedded its requirements content directly and no on-disk path
/// could be recovered for it. A state carrying this sentinel can never be
/// resumed: the caller must restart with `start`.
pub const MIGRATED_SENTINEL: &str = "__migrated__";

/// Owns `state.json` inside a working directory and mediates every read and
/// write against it.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            path: working_dir.join(".autonoma").join("state.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads and migrates `state.json`, returning
    /// [`StateError::NotFound`] if it doesn't exist yet.
    pub fn load(&self) -> Result<PersistedState, StateError> {
        if !self.path.exists() {
            return Err(StateError::NotFound(self.path.display().to_string()));
        }

        let _lock = self.acquire_shared_lock()?;
        let text = std::fs::read_to_string(&self.path).map_err(|source| StateError::Read {
            path: self.path.display().to_string(),
            source,
        })?;

        let mut raw: Value = serde_json::from_str(&text).map_err(|source| StateError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;

        let found_version = raw
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;

        if found_version > STATE_VERSION {
            return Err(StateError::FutureVersion {
                found: found_version,
                supported: STATE_VERSION,
            });
        }

        migrations::migrate(&mut raw, found_version);

        if raw.get("requirements_path").and_then(Value::as_str) == Some(MIGRATED_SENTINEL) {
            return Err(StateError::UnresumableMigration {
                path: self.path.display().to_string(),
            });
        }

        serde_json::from_value(raw).map_err(|source| StateError::Parse {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Writes `state` atomically: serialize to `state.json.tmp`, `fsync`,
    /// then `rename` over `state.json`. A crash mid-write leaves the old
    /// file intact — `rename` on the same filesystem is atomic.
    pub fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let tmp_path = self.path.with_extension("json.tmp");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|source| StateError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;

        let text = serde_json::to_string_pretty(state).map_err(|source| StateError::Parse {
            path: tmp_path.display().to_string(),
            source,
        })?;

        file.write_all(text.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|source| StateError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;

        let _lock = self.acquire_exclusive_lock_on(&self.path)?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| StateError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn acquire_shared_lock(&self) -> Result<File, StateError> {
        let file = File::open(&self.path).map_err(|source| StateError::Lock {
            path: self.path.display().to_string(),
            source,
        })?;
        file.lock_shared().map_err(|source| StateError::Lock {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(file)
    }

    fn acquire_exclusive_lock_on(&self, path: &Path) -> Result<File, StateError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|source| StateError::Lock {
                path: path.display().to_string(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| StateError::Lock {
            path: path.display().to_string(),
            source,
        })?;
        Ok(file)
    }
}

/// Phases a fresh [`PersistedState`] is initialized with are always empty;
/// helper used by `Orchestrator::start` and `Orchestrator::adopt`.
pub fn fresh_state(
    requirements_path: &str,
    has_project_context: bool,
    context_paths: Vec<String>,
) -> PersistedState {
    let mut state = PersistedState::new(requirements_path, has_project_context);
    state.phase = Phase::Idle;
    state.context_paths = context_paths;
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PersistedState;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut state = PersistedState::new("REQUIREMENTS.md", true);
        state.complete_phase(Phase::Planning);

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.requirements_path, "REQUIREMENTS.md");
        assert!(loaded.has_completed(Phase::Planning));
        assert_eq!(loaded.version, STATE_VERSION);
    }

    #[test]
    fn load_missing_file_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(matches!(store.load(), Err(StateError::NotFound(_))));
    }

    #[test]
    fn load_future_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), r#"{"version": 999}"#).unwrap();
        assert!(matches!(
            store.load(),
            Err(StateError::FutureVersion { found: 999, .. })
        ));
    }

    #[test]
    fn load_rejects_unresumable_migrated_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            serde_json::json!({
                "version": 2,
                "requirements_path": MIGRATED_SENTINEL,
                "started_at": "2026-01-01T00:00:00Z",
                "updated_at": "2026-01-01T00:00:00Z",
                "phase": "idle",
                "plan": {"milestones": []},
                "batches": [],
                "current_batch_index": 0,
            })
            .to_string(),
        )
        .unwrap();
        assert!(matches!(
            store.load(),
            Err(StateError::UnresumableMigration { .. })
        ));
    }

    #[test]
    fn save_does_not_leave_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = PersistedState::new("r.md", false);
        store.save(&state).unwrap();
        assert!(!store.path.with_extension("json.tmp").exists());
    }
}
