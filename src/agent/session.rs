//! `AgentSession`: spawns one agent subprocess turn, streams its stdout,
//! and enforces a hard wall-clock timeout.
//!
//! Races process-exit-or-EOF against a single `tokio::time::sleep`, since
//! Autonoma has no separate callback channel to also race against.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::AutonomaConfig;
use crate::errors::AgentError;
use crate::model::{Role, TokenUsage};

use super::stream::StreamEvent;

/// Everything one subprocess turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub raw_output: String,
    pub token_usage: TokenUsage,
    pub tool_calls: Vec<String>,
}

/// Drives a single agent subprocess invocation.
pub struct AgentSession<'a> {
    config: &'a AutonomaConfig,
    working_dir: PathBuf,
}

impl<'a> AgentSession<'a> {
    pub fn new(config: &'a AutonomaConfig, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            working_dir: working_dir.into(),
        }
    }

    /// Runs one turn: writes `prompt` to the agent's stdin, streams its
    /// stdout, and returns the accumulated text plus usage once the
    /// process exits — or [`AgentError::Timeout`] if it runs past
    /// `config.timeout_for(role)`.
    pub async fn run_turn(
        &self,
        agent_id: &str,
        role: Role,
        prompt: &str,
    ) -> Result<TurnOutcome, AgentError> {
        let timeout = self.config.timeout_for(role);
        let command = &self.config.agent_binary.command;

        let mut child = Command::new(command)
            .args(&self.config.agent_binary.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| AgentError::Spawn {
                command: command.clone(),
                source,
            })?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        let prompt = prompt.to_string();
        let write_task = tokio::spawn(async move {
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });

        let stdout = child.stdout.take().expect("stdout was piped");
        let read_and_wait = async {
            let mut reader = BufReader::new(stdout).lines();
            let mut raw_output = String::new();
            let mut tool_calls = Vec::new();
            let mut usage = TokenUsage::default();
            let mut saw_any_event = false;

            while let Ok(Some(line)) = reader.next_line().await {
                match StreamEvent::parse_line(&line) {
                    Some(StreamEvent::AssistantText(text)) => {
                        saw_any_event = true;
                        raw_output.push_str(&text);
                        raw_output.push('\n');
                    }
                    Some(StreamEvent::ToolUse(desc)) => {
                        saw_any_event = true;
                        tool_calls.push(desc);
                    }
                    Some(StreamEvent::Result(u)) => {
                        saw_any_event = true;
                        usage = u;
                    }
                    Some(StreamEvent::Other) => saw_any_event = true,
                    None => {
                        // Non-streaming binary: treat every raw line as output text.
                        raw_output.push_str(&line);
                        raw_output.push('\n');
                    }
                }
            }

            let status = child.wait().await.map_err(AgentError::Io)?;
            let _ = saw_any_event;
            Ok::<_, AgentError>((raw_output, usage, tool_calls, status))
        };

        let result = tokio::time::timeout(timeout, read_and_wait).await;
        let _ = write_task.await;

        match result {
            Ok(Ok((raw_output, token_usage, tool_calls, status))) => {
                self.write_agent_log(agent_id, role, &raw_output);
                if raw_output.trim().is_empty() {
                    return Err(AgentError::EmptyOutput {
                        agent_id: agent_id.to_string(),
                    });
                }
                if !status.success() {
                    return Err(AgentError::NonZeroExit {
                        agent_id: agent_id.to_string(),
                        code: status.code(),
                    });
                }
                Ok(TurnOutcome {
                    raw_output,
                    token_usage,
                    tool_calls,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => {
                self.write_agent_log(agent_id, role, "<turn timed out before producing output>");
                Err(AgentError::Timeout {
                    agent_id: agent_id.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    /// Persists the raw transcript of one turn under `.autonoma/logs/` —
    /// one file per turn rather than a single growing log, so a resumed
    /// run's history stays browsable invocation-by-invocation.
    fn write_agent_log(&self, agent_id: &str, role: Role, raw_output: &str) {
        let path = agent_log_path(&self.working_dir, role, agent_id, chrono::Utc::now());
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let _ = std::fs::write(&path, raw_output);
    }
}

/// Builds the on-disk agent-invocation log path, `.autonoma/logs/<role>-<UTC-ISO-timestamp>.log`.
pub fn agent_log_path(
    working_dir: &Path,
    role: Role,
    agent_id: &str,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> PathBuf {
    working_dir.join(".autonoma").join("logs").join(format!(
        "{role}-{agent_id}-{}.log",
        timestamp.format("%Y%m%dT%H%M%S%.3fZ")
    ))
}

/// Builds the on-disk prompt audit trail path for an agent turn.
pub fn prompt_log_path(working_dir: &Path, agent_id: &str, turn: u64) -> PathBuf {
    working_dir
        .join(".autonoma")
        .join("prompts")
        .join(format!("{agent_id}-{turn:04}.txt"))
}
