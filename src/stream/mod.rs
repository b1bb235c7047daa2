//! Assistant stream-json protocol: caller-facing events and the wire shapes
//! they are decoded from.
//!
//! Raw stdout bytes flow through [`framing`] (newline reassembly and JSON
//! decoding) and then [`demux`] (classification into [`ProtocolEvent`]s).

pub mod demux;
pub mod framing;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use demux::{SequenceGuard, demux_record};
pub use framing::{LineFramer, RecordReader, decode_line};

/// One typed event emitted by the assistant during a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolEvent {
    SystemInit {
        session_token: String,
        model: Option<String>,
        tools: Vec<String>,
    },
    AssistantText {
        text: String,
    },
    ToolUseRequest {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    PermissionNeeded {
        tool_use_id: String,
        raw_content: String,
    },
    FinalResult {
        text: String,
        cost: Option<f64>,
        usage: Value,
        permission_denials: Vec<Value>,
        is_error: bool,
    },
    StreamError {
        message: String,
    },
}

impl ProtocolEvent {
    /// `FinalResult` and `StreamError` end a turn's event sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProtocolEvent::FinalResult { .. } | ProtocolEvent::StreamError { .. }
        )
    }

    pub fn stream_error(message: impl Into<String>) -> Self {
        ProtocolEvent::StreamError {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolEvent::SystemInit { .. } => "system_init",
            ProtocolEvent::AssistantText { .. } => "assistant_text",
            ProtocolEvent::ToolUseRequest { .. } => "tool_use_request",
            ProtocolEvent::ToolResult { .. } => "tool_result",
            ProtocolEvent::PermissionNeeded { .. } => "permission_needed",
            ProtocolEvent::FinalResult { .. } => "final_result",
            ProtocolEvent::StreamError { .. } => "stream_error",
        }
    }
}

/// A typed item inside a record's `message.content` array.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
    /// Thinking blocks, images and anything newer than this client
    #[serde(other)]
    Other,
}

/// `tool_result.content` is either a bare string or a list of text blocks.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        ToolResultContent::Text(String::new())
    }
}

impl ToolResultContent {
    /// Join all textual parts into one string.
    pub fn flatten(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    Value::String(s) => Some(s.as_str()),
                    other => other.get("text").and_then(|t| t.as_str()),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Short human-readable description of a tool invocation.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match name {
        "Read" | "Write" | "Edit" => match field("file_path") {
            Some(path) => format!("{}: {}", name, shorten_path(path)),
            None => name.to_string(),
        },
        "Bash" => match field("command") {
            Some(cmd) => format!("Bash: {}", truncate_str(cmd, 40)),
            None => name.to_string(),
        },
        "Glob" | "Grep" => match field("pattern") {
            Some(pattern) => format!("{}: {}", name, truncate_str(pattern, 30)),
            None => name.to_string(),
        },
        "WebSearch" => match field("query") {
            Some(query) => format!("Search: {}", truncate_str(query, 40)),
            None => name.to_string(),
        },
        _ => name.to_string(),
    }
}

/// Keep only the last two path components.
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
