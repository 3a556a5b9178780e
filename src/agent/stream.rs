//! Parses an agent subprocess's streamed JSON stdout, one line per event.
//!
//! Agent binaries that support it are invoked with a line-delimited JSON
//! stream output mode; each line is one of a small set of event shapes.
//! Binaries that don't support streaming JSON just produce one
//! non-JSON-parseable blob of text, which [`StreamEvent::parse_line`]
//! reports as `None` — the caller then falls back to treating the whole
//! stdout capture as plain text (see `AgentSession::run`).

use serde::Deserialize;
use serde_json::Value;

use crate::model::TokenUsage;

/// One line of an agent's streamed JSON output.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The agent emitted a chunk of assistant-authored text.
    AssistantText(String),
    /// The agent invoked a tool; carries a short human-readable
    /// description for logging (e.g. `"Read(src/main.rs)"`).
    ToolUse(String),
    /// Terminal "result" event carrying cumulative usage and cost.
    Result(TokenUsage),
    /// Anything else (system/user echo events) — logged at debug level,
    /// otherwise ignored.
    Other,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    usage: Option<RawUsage>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
}

#[derive(Deserialize, Clone)]
struct RawMessage {
    #[serde(default)]
    content: Vec<RawContentBlock>,
}

#[derive(Deserialize, Clone)]
struct RawContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl StreamEvent {
    /// Parses one line of streamed stdout. Returns `None` for lines that
    /// aren't valid JSON at all (blank lines, or a non-streaming binary's
    /// plain-text output).
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let raw: RawEvent = serde_json::from_str(line).ok()?;

        Some(match raw.kind.as_str() {
            "assistant" => {
                let text = raw
                    .message
                    .clone()
                    .map(|m| {
                        m.content
                            .into_iter()
                            .filter_map(|block| match block.kind.as_str() {
                                "text" => block.text,
                                "tool_use" => None,
                                _ => None,
                            })
                            .collect::<Vec<_>>()
                            .join("")
                    })
                    .unwrap_or_default();
                if text.is_empty() {
                    return Self::tool_use_from(raw.message);
                }
                StreamEvent::AssistantText(text)
            }
            "result" => {
                let usage = raw.usage.unwrap_or(RawUsage {
                    input_tokens: 0,
                    output_tokens: 0,
                });
                StreamEvent::Result(TokenUsage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    cost_usd: raw.total_cost_usd.unwrap_or(0.0),
                })
            }
            _ => StreamEvent::Other,
        })
    }

    fn tool_use_from(message: Option<RawMessage>) -> Option<Self> {
        let block = message?.content.into_iter().find(|b| b.kind == "tool_use")?;
        let name = block.name.unwrap_or_else(|| "tool".to_string());
        let summary = block
            .input
            .as_ref()
            .and_then(|v| v.get("file_path").or_else(|| v.get("path")))
            .and_then(Value::as_str)
            .map(|p| format!("{name}({p})"))
            .unwrap_or(name);
        Some(StreamEvent::ToolUse(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_text_event() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"}]}}"#;
        match StreamEvent::parse_line(line) {
            Some(StreamEvent::AssistantText(text)) => assert_eq!(text, "working on it"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_tool_use_event_with_file_path() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"src/main.rs"}}]}}"#;
        match StreamEvent::parse_line(line) {
            Some(StreamEvent::ToolUse(desc)) => assert_eq!(desc, "Read(src/main.rs)"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_result_event_usage() {
        let line = r#"{"type":"result","usage":{"input_tokens":100,"output_tokens":50},"total_cost_usd":0.02}"#;
        match StreamEvent::parse_line(line) {
            Some(StreamEvent::Result(usage)) => {
                assert_eq!(usage.input_tokens, 100);
                assert_eq!(usage.output_tokens, 50);
                assert!((usage.cost_usd - 0.02).abs() < f64::EPSILON);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn non_json_line_returns_none() {
        assert!(StreamEvent::parse_line("plain text, not json").is_none());
        assert!(StreamEvent::parse_line("").is_none());
    }
}
