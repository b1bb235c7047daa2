//! Caller-to-process control messages and their delivery.
//!
//! A [`ControlPlane`] belongs to one caller connection. It maps each of that
//! connection's conversations to the stdin slot of its live turn, so a control
//! message can only ever reach a process owned by the same connection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::process::StdinWriter;

/// Out-of-band message for a live assistant process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    PermissionResponse { tool_use_id: String, allowed: bool },
    SlashCommand { text: String },
}

/// Wire shape of a permission response.
///
/// The assistant has accepted different shapes across versions and does not
/// acknowledge any of them, so every configured shape is written in
/// declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionWireFormat {
    /// `{"type":"permission","permission":{...}}`
    Permission,
    /// `{"type":"permission_response",...}` with the fields at top level
    PermissionResponse,
    /// `{"type":"control_response",...}` keyed by the tool use id
    ControlResponse,
}

impl PermissionWireFormat {
    pub const ALL: [PermissionWireFormat; 3] = [
        PermissionWireFormat::Permission,
        PermissionWireFormat::PermissionResponse,
        PermissionWireFormat::ControlResponse,
    ];

    pub fn encode(self, tool_use_id: &str, allowed: bool) -> Value {
        match self {
            PermissionWireFormat::Permission => json!({
                "type": "permission",
                "permission": {"tool_use_id": tool_use_id, "allowed": allowed},
            }),
            PermissionWireFormat::PermissionResponse => json!({
                "type": "permission_response",
                "tool_use_id": tool_use_id,
                "allowed": allowed,
            }),
            PermissionWireFormat::ControlResponse => json!({
                "type": "control_response",
                "response": {
                    "subtype": "success",
                    "request_id": tool_use_id,
                    "response": {"behavior": if allowed { "allow" } else { "deny" }},
                },
            }),
        }
    }
}

/// The user-turn record: `{"type":"user","message":{"role":"user","content":...}}`.
pub fn user_message(content: &str) -> Value {
    json!({
        "type": "user",
        "message": {"role": "user", "content": content},
    })
}

impl ControlMessage {
    /// JSON lines to write for this message, in order.
    pub fn wire_messages(&self, formats: &[PermissionWireFormat]) -> Vec<Value> {
        match self {
            ControlMessage::PermissionResponse {
                tool_use_id,
                allowed,
            } => formats
                .iter()
                .map(|format| format.encode(tool_use_id, *allowed))
                .collect(),
            ControlMessage::SlashCommand { text } => vec![user_message(text)],
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ControlMessage::PermissionResponse { .. } => "permission_response",
            ControlMessage::SlashCommand { .. } => "slash_command",
        }
    }
}

/// Result of forwarding a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDelivery {
    /// All frames were handed to the process (write failures are logged)
    Delivered { frames: usize },
    /// No process is live for the conversation; the message was dropped
    NoLiveProcess,
}

/// Per-connection routing table from conversation to live stdin.
#[derive(Debug)]
pub struct ControlPlane {
    live: HashMap<String, watch::Receiver<Option<StdinWriter>>>,
    formats: Vec<PermissionWireFormat>,
}

impl ControlPlane {
    pub fn new(formats: Vec<PermissionWireFormat>) -> Self {
        Self {
            live: HashMap::new(),
            formats,
        }
    }

    /// Route control messages for `conversation_id` to the given stdin slot.
    pub fn attach(&mut self, conversation_id: &str, slot: watch::Receiver<Option<StdinWriter>>) {
        self.live.insert(conversation_id.to_string(), slot);
    }

    pub fn detach(&mut self, conversation_id: &str) {
        self.live.remove(conversation_id);
    }

    /// True while the conversation's process has an open stdin.
    pub fn is_live(&self, conversation_id: &str) -> bool {
        self.writer_for(conversation_id).is_some()
    }

    fn writer_for(&self, conversation_id: &str) -> Option<StdinWriter> {
        self.live
            .get(conversation_id)
            .and_then(|slot| slot.borrow().clone())
    }

    /// Write `message` to the conversation's live process and wait for the
    /// pipe to accept it.
    ///
    /// Never fails: a missing process yields [`ControlDelivery::NoLiveProcess`]
    /// and write errors are logged, since the read side notices process death
    /// on its own.
    pub async fn forward(&self, conversation_id: &str, message: &ControlMessage) -> ControlDelivery {
        let Some(writer) = self.live_writer(conversation_id, message) else {
            return ControlDelivery::NoLiveProcess;
        };
        let frames = message.wire_messages(&self.formats);
        let count = frames.len();
        write_frames(&writer, conversation_id, message.label(), frames).await;
        ControlDelivery::Delivered { frames: count }
    }

    /// Like [`ControlPlane::forward`], but hands the write to a background
    /// task and returns at once, so a process that stops reading stdin cannot
    /// stall the caller.
    pub fn dispatch(&self, conversation_id: &str, message: &ControlMessage) -> ControlDelivery {
        let Some(writer) = self.live_writer(conversation_id, message) else {
            return ControlDelivery::NoLiveProcess;
        };
        let frames = message.wire_messages(&self.formats);
        let count = frames.len();
        let conversation_id = conversation_id.to_string();
        let label = message.label();
        tokio::spawn(async move {
            write_frames(&writer, &conversation_id, label, frames).await;
        });
        ControlDelivery::Delivered { frames: count }
    }

    fn live_writer(&self, conversation_id: &str, message: &ControlMessage) -> Option<StdinWriter> {
        let writer = self.writer_for(conversation_id);
        if writer.is_none() {
            warn!(
                conversation_id,
                message = message.label(),
                "dropping control message: no live process for conversation"
            );
        }
        writer
    }
}

async fn write_frames(writer: &StdinWriter, conversation_id: &str, label: &str, frames: Vec<Value>) {
    let count = frames.len();
    for frame in frames {
        if let Err(e) = writer.send(&frame).await {
            warn!(conversation_id, message = label, error = %e, "failed to write control message");
            return;
        }
    }
    debug!(conversation_id, message = label, frames = count, "forwarded control message");
}
