//! Classification of decoded protocol records into [`ProtocolEvent`]s.
//!
//! [`demux_record`] is a pure function of one record. [`SequenceGuard`] holds
//! the per-turn ordering rules: `SystemInit` at most once and only first,
//! nothing after a terminal event, and accumulation of the assistant's text.

use serde_json::Value;
use tracing::{debug, warn};

use super::{ContentBlock, ProtocolEvent};

/// Tool-result text that marks a permission prompt rather than a tool error.
///
/// This is a substring heuristic over free text; the protocol has no
/// structured field for it.
pub const PERMISSION_DENIAL_MARKER: &str = "requested permissions";

/// Turn one decoded record into zero or more events, in content order.
///
/// Unknown record types and content items are dropped with a debug log.
pub fn demux_record(record: &Value) -> Vec<ProtocolEvent> {
    let Some(tag) = record.get("type").and_then(|t| t.as_str()) else {
        debug!("dropping record without a type tag");
        return Vec::new();
    };

    match tag {
        "system" => demux_system(record).into_iter().collect(),
        "assistant" => content_blocks(record)
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(ProtocolEvent::AssistantText { text }),
                ContentBlock::ToolUse { id, name, input } => Some(ProtocolEvent::ToolUseRequest {
                    tool_use_id: id,
                    name,
                    input,
                }),
                _ => None,
            })
            .collect(),
        "user" => content_blocks(record)
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let text = content.flatten();
                    if signals_permission_denial(&text) {
                        Some(ProtocolEvent::PermissionNeeded {
                            tool_use_id,
                            raw_content: text,
                        })
                    } else {
                        Some(ProtocolEvent::ToolResult {
                            tool_use_id,
                            content: text,
                            is_error,
                        })
                    }
                }
                _ => None,
            })
            .collect(),
        "result" => vec![demux_result(record)],
        "error" => vec![ProtocolEvent::StreamError {
            message: error_message(record),
        }],
        other => {
            debug!(record_type = other, "dropping unrecognized record type");
            Vec::new()
        }
    }
}

fn demux_system(record: &Value) -> Option<ProtocolEvent> {
    let subtype = record.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
    if subtype != "init" {
        debug!(subtype, "dropping system record");
        return None;
    }
    let Some(session_token) = record.get("session_id").and_then(|s| s.as_str()) else {
        warn!("system init record has no session_id");
        return None;
    };
    let model = record
        .get("model")
        .and_then(|m| m.as_str())
        .map(str::to_string);
    let tools = record
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| match tool {
                    Value::String(name) => Some(name.clone()),
                    other => other.get("name").and_then(|n| n.as_str()).map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ProtocolEvent::SystemInit {
        session_token: session_token.to_string(),
        model,
        tools,
    })
}

fn demux_result(record: &Value) -> ProtocolEvent {
    let text = record
        .get("result")
        .and_then(|r| r.as_str())
        .unwrap_or_default()
        .to_string();
    let cost = record
        .get("total_cost_usd")
        .or_else(|| record.get("cost_usd"))
        .and_then(|c| c.as_f64());
    let usage = match record.get("usage") {
        Some(usage) if !usage.is_null() => usage.clone(),
        _ => Value::Object(Default::default()),
    };
    let permission_denials = record
        .get("permission_denials")
        .and_then(|d| d.as_array())
        .cloned()
        .unwrap_or_default();
    let is_error = record
        .get("is_error")
        .and_then(|e| e.as_bool())
        .unwrap_or(false);

    ProtocolEvent::FinalResult {
        text,
        cost,
        usage,
        permission_denials,
        is_error,
    }
}

fn error_message(record: &Value) -> String {
    let error = record.get("error");
    error
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .or_else(|| error.and_then(|e| e.as_str()))
        .or_else(|| record.get("message").and_then(|m| m.as_str()))
        .unwrap_or("Assistant reported an unspecified error")
        .to_string()
}

/// Decode `message.content` items one by one so a single odd item does not
/// hide its siblings.
fn content_blocks(record: &Value) -> Vec<ContentBlock> {
    let Some(items) = record
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
    else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<ContentBlock>(item.clone()) {
            Ok(block) => Some(block),
            Err(e) => {
                debug!(error = %e, "dropping undecodable content item");
                None
            }
        })
        .collect()
}

fn signals_permission_denial(text: &str) -> bool {
    text.to_lowercase().contains(PERMISSION_DENIAL_MARKER)
}

/// Enforces per-turn event ordering and accumulates the response text.
#[derive(Debug, Default)]
pub struct SequenceGuard {
    emitted: usize,
    initialized: bool,
    terminal: Option<&'static str>,
    text: String,
    result_text: Option<String>,
    session_token: Option<String>,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `event` into the turn's sequence, or drop it.
    pub fn accept(&mut self, event: ProtocolEvent) -> Option<ProtocolEvent> {
        if let Some(kind) = self.terminal {
            debug!(event = event.kind(), after = kind, "dropping event after terminal event");
            return None;
        }

        match &event {
            ProtocolEvent::SystemInit { session_token, .. } => {
                if self.initialized || self.emitted > 0 {
                    warn!(
                        session_token = %session_token,
                        "dropping out-of-order system init event"
                    );
                    return None;
                }
                self.initialized = true;
                self.session_token = Some(session_token.clone());
            }
            ProtocolEvent::AssistantText { text } => self.text.push_str(text),
            ProtocolEvent::FinalResult { text, .. } => {
                self.result_text = Some(text.clone());
                self.terminal = Some(event.kind());
            }
            ProtocolEvent::StreamError { .. } => self.terminal = Some(event.kind()),
            _ => {}
        }

        self.emitted += 1;
        Some(event)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminal.is_some()
    }

    /// True when the sequence ended with a `FinalResult`.
    pub fn completed(&self) -> bool {
        self.terminal == Some("final_result")
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Accumulated assistant text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The text worth persisting: streamed text, or the result text if the
    /// assistant streamed none.
    pub fn response_text(&self) -> String {
        match &self.result_text {
            Some(result) if self.text.is_empty() => result.clone(),
            _ => self.text.clone(),
        }
    }
}
