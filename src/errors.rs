//! Typed error taxonomy.
//!
//! Each component gets its own `thiserror` enum so callers can match on
//! cause rather than string-sniffing; `anyhow::Result` is used only at the
//! outermost call boundaries (`main.rs`, `Orchestrator` entry points) where
//! the caller just needs a renderable error and an exit code.

use thiserror::Error;

/// Errors from the `AgentSession` subprocess layer.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent subprocess `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent `{agent_id}` exceeded its {timeout_secs}s timeout")]
    Timeout { agent_id: String, timeout_secs: u64 },

    #[error("agent `{agent_id}` exited with status {code:?}")]
    NonZeroExit { agent_id: String, code: Option<i32> },

    #[error("failed to read agent stdout: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent `{agent_id}` produced no parseable output before exiting")]
    EmptyOutput { agent_id: String },
}

/// Errors from `ProtocolParser`.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no JSON object found in agent output")]
    NoJsonFound,

    #[error("failed to deserialize protocol payload: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("protocol payload missing required field `{0}`")]
    MissingField(&'static str),
}

/// Errors from `StateStore`.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to acquire lock on state file {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read state file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("state schema version {found} is newer than this binary supports ({supported})")]
    FutureVersion { found: u32, supported: u32 },

    #[error("no state file found at {0}")]
    NotFound(String),

    #[error(
        "state file {path} was migrated from a version whose requirements content is no \
         longer recoverable; restart the orchestration with `start` instead of `resume`"
    )]
    UnresumableMigration { path: String },
}

/// Errors from an individual `PhaseRunner`.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("agent error during {phase} phase: {source}")]
    Agent {
        phase: String,
        #[source]
        source: AgentError,
    },

    #[error("protocol error during {phase} phase: {source}")]
    Protocol {
        phase: String,
        #[source]
        source: ProtocolError,
    },

    #[error("{phase} phase exhausted its retry budget after {attempts} attempts")]
    RetriesExhausted { phase: String, attempts: u32 },

    #[error("{phase} phase is blocked pending human input: {reason}")]
    Blocked { phase: String, reason: String },

    #[error("state error during {phase} phase: {source}")]
    State {
        phase: String,
        #[source]
        source: StateError,
    },
}

/// Errors from the embedded `autonoma.db` store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration {version} failed: {source}")]
    Migration {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to serialize row payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to prepare database directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error returned by `Orchestrator` entry points.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("orchestration aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_error_wraps_and_displays_source() {
        let err = PhaseError::Agent {
            phase: "development".into(),
            source: AgentError::Timeout {
                agent_id: "dev-1".into(),
                timeout_secs: 600,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("development"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn orchestrator_error_converts_from_phase_error() {
        let phase_err = PhaseError::RetriesExhausted {
            phase: "testing".into(),
            attempts: 2,
        };
        let orch_err: OrchestratorError = phase_err.into();
        assert!(matches!(orch_err, OrchestratorError::Phase(_)));
    }

    #[test]
    fn store_error_converts_from_sqlite() {
        let sqlite_err = rusqlite::Error::InvalidQuery;
        let store_err: StoreError = sqlite_err.into();
        assert!(matches!(store_err, StoreError::Sqlite(_)));
    }

    #[test]
    fn phase_error_blocked_carries_reason() {
        let err = PhaseError::Blocked {
            phase: "review".into(),
            reason: "retries exhausted, awaiting human input".into(),
        };
        assert!(err.to_string().contains("review"));
        assert!(err.to_string().contains("human input"));
    }
}
