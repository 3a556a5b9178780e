//! Layered configuration: defaults → `autonoma.toml` → environment
//! variables. A struct with `#[serde(default)]` fields merged against an
//! optional on-disk file, then overridden by `AUTONOMA_*` env vars and
//! finally CLI flags at the call site.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::model::STATE_VERSION;

/// Which subprocess command launches an agent. Kept generic (not hardcoded
/// to a single vendor binary) since the agent binary is treated as
/// external and swappable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBinaryConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for AgentBinaryConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: Vec::new(),
        }
    }
}

fn default_agent_command() -> String {
    "claude".to_string()
}

/// Context-budget threshold ladder, percentages of an agent's context
/// window at which `ContextWatcher` fires successive warnings before
/// forcing a handoff. Uses a `{40,50,60,70,75}` percent-of-budget ladder.
fn default_thresholds() -> Vec<u8> {
    vec![40, 50, 60, 70, 75]
}

/// Timeouts, in seconds, keyed by role. `AgentSession` falls back to
/// `default_timeout_secs` for roles not listed here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default)]
    pub ceo_secs: Option<u64>,
    #[serde(default)]
    pub staff_secs: Option<u64>,
    #[serde(default)]
    pub developer_secs: Option<u64>,
    #[serde(default)]
    pub qa_secs: Option<u64>,
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_max_ceo_approval_attempts() -> u32 {
    3
}

fn default_max_parallel_developers() -> usize {
    4
}

fn default_verification_timeout_secs() -> u64 {
    600
}

/// The full layered configuration used by the `Orchestrator` and every
/// `PhaseRunner`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomaConfig {
    pub agent_binary: AgentBinaryConfig,
    #[serde(default = "default_thresholds")]
    pub context_thresholds: Vec<u8>,
    pub timeouts: TimeoutsConfig,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_ceo_approval_attempts")]
    pub max_ceo_approval_attempts: u32,
    #[serde(default = "default_max_parallel_developers")]
    pub max_parallel_developers: usize,
    #[serde(default = "default_verification_timeout_secs")]
    pub verification_timeout_secs: u64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub requirements_path: Option<String>,
    #[serde(default)]
    pub project_context_path: Option<String>,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for AutonomaConfig {
    fn default() -> Self {
        Self {
            agent_binary: AgentBinaryConfig::default(),
            context_thresholds: default_thresholds(),
            timeouts: TimeoutsConfig::default(),
            default_timeout_secs: default_timeout_secs(),
            max_ceo_approval_attempts: default_max_ceo_approval_attempts(),
            max_parallel_developers: default_max_parallel_developers(),
            verification_timeout_secs: default_verification_timeout_secs(),
            working_dir: None,
            requirements_path: None,
            project_context_path: None,
            log_json: false,
        }
    }
}

impl AutonomaConfig {
    /// Loads `autonoma.toml` from `dir` if present, then applies
    /// `AUTONOMA_*` environment variable overrides. Never errors on a
    /// missing file — an absent config is just defaults.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let mut config = Self::default();

        let candidate = dir.join("autonoma.toml");
        if candidate.exists() {
            let text = std::fs::read_to_string(&candidate)?;
            config = toml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", candidate.display()))?;
        }

        config.apply_env_overrides();
        config.context_thresholds.sort_unstable();
        config.context_thresholds.dedup();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AUTONOMA_AGENT_COMMAND") {
            self.agent_binary.command = v;
        }
        if let Ok(v) = std::env::var("AUTONOMA_DEFAULT_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.default_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("AUTONOMA_MAX_PARALLEL_DEVELOPERS") {
            if let Ok(n) = v.parse() {
                self.max_parallel_developers = n;
            }
        }
        if let Ok(v) = std::env::var("AUTONOMA_LOG_JSON") {
            self.log_json = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }

    /// Timeout to use for a given role, honoring a per-role override before
    /// falling back to `default_timeout_secs`.
    pub fn timeout_for(&self, role: crate::model::Role) -> std::time::Duration {
        use crate::model::Role;
        let secs = match role {
            Role::Ceo => self.timeouts.ceo_secs,
            Role::Staff => self.timeouts.staff_secs,
            Role::Developer => self.timeouts.developer_secs,
            Role::Qa | Role::E2e => self.timeouts.qa_secs,
        }
        .unwrap_or(self.default_timeout_secs);
        std::time::Duration::from_secs(secs)
    }

    pub fn state_schema_version(&self) -> u32 {
        STATE_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = AutonomaConfig::default();
        assert_eq!(config.agent_binary.command, "claude");
        assert_eq!(config.context_thresholds, vec![40, 50, 60, 70, 75]);
        assert_eq!(config.max_ceo_approval_attempts, 3);
    }

    #[test]
    fn load_with_no_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AutonomaConfig::load(dir.path()).unwrap();
        assert_eq!(config.max_parallel_developers, 4);
    }

    #[test]
    fn load_parses_partial_toml_file_with_defaults_for_rest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("autonoma.toml"),
            "max_parallel_developers = 8\n\n[agent_binary]\ncommand = \"my-agent\"\n",
        )
        .unwrap();
        let config = AutonomaConfig::load(dir.path()).unwrap();
        assert_eq!(config.max_parallel_developers, 8);
        assert_eq!(config.agent_binary.command, "my-agent");
        assert_eq!(config.default_timeout_secs, default_timeout_secs());
    }

    #[test]
    fn timeout_for_role_falls_back_to_default() {
        let mut config = AutonomaConfig::default();
        config.timeouts.developer_secs = Some(900);
        assert_eq!(
            config.timeout_for(crate::model::Role::Developer),
            std::time::Duration::from_secs(900)
        );
        assert_eq!(
            config.timeout_for(crate::model::Role::Staff),
            std::time::Duration::from_secs(config.default_timeout_secs)
        );
    }
}
