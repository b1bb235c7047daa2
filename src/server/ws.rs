use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ChatRequest, SharedState, prepare_turn, save_reply};
use crate::errors::GatewayError;
use crate::orchestrator::turn::round_secs;
use crate::orchestrator::{ControlDelivery, ControlMessage, ControlPlane, TurnStatus, TurnStream};
use crate::stream::{ProtocolEvent, describe_tool_use};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

/// Frames sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected,
    Pong,
    Start {
        conversation_id: String,
    },
    SystemInit {
        session_id: String,
        model: Option<String>,
        tools: Vec<String>,
    },
    Chunk {
        content: String,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        input: Value,
        summary: String,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    PermissionRequest {
        tool_use_id: String,
        content: String,
    },
    FinalResult {
        text: String,
        cost: Option<f64>,
        usage: Value,
        permission_denials: Vec<Value>,
        is_error: bool,
    },
    Error {
        content: String,
    },
    /// Non-terminal notice, e.g. a dropped control message
    Warning {
        content: String,
    },
    Done {
        elapsed: f64,
        conversation_id: String,
    },
}

impl From<ProtocolEvent> for ServerMessage {
    fn from(event: ProtocolEvent) -> Self {
        match event {
            ProtocolEvent::SystemInit {
                session_token,
                model,
                tools,
            } => ServerMessage::SystemInit {
                session_id: session_token,
                model,
                tools,
            },
            ProtocolEvent::AssistantText { text } => ServerMessage::Chunk { content: text },
            ProtocolEvent::ToolUseRequest {
                tool_use_id,
                name,
                input,
            } => ServerMessage::ToolUse {
                summary: describe_tool_use(&name, &input),
                tool_use_id,
                name,
                input,
            },
            ProtocolEvent::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => ServerMessage::ToolResult {
                tool_use_id,
                content,
                is_error,
            },
            ProtocolEvent::PermissionNeeded {
                tool_use_id,
                raw_content,
            } => ServerMessage::PermissionRequest {
                tool_use_id,
                content: raw_content,
            },
            ProtocolEvent::FinalResult {
                text,
                cost,
                usage,
                permission_denials,
                is_error,
            } => ServerMessage::FinalResult {
                text,
                cost,
                usage,
                permission_denials,
                is_error,
            },
            ProtocolEvent::StreamError { message } => ServerMessage::Error { content: message },
        }
    }
}

/// Frames received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Chat(ChatRequest),
    PermissionResponse {
        conversation_id: Option<String>,
        tool_use_id: String,
        allowed: bool,
    },
    SlashCommand {
        conversation_id: Option<String>,
        text: String,
    },
    Ping,
}

#[derive(Deserialize)]
struct PermissionPayload {
    conversation_id: Option<String>,
    tool_use_id: String,
    allowed: bool,
}

#[derive(Deserialize)]
struct SlashPayload {
    conversation_id: Option<String>,
    #[serde(alias = "command")]
    text: String,
}

impl ClientMessage {
    /// Parse a text frame. A frame without a `type` is a chat request.
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| GatewayError::BadRequest(format!("invalid JSON frame: {}", e)))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("chat")
            .to_string();
        let bad = |e: serde_json::Error| GatewayError::BadRequest(format!("invalid {} frame: {}", kind, e));

        match kind.as_str() {
            "ping" => Ok(ClientMessage::Ping),
            "chat" | "message" => serde_json::from_value(value).map(ClientMessage::Chat).map_err(bad),
            "permission_response" => {
                let payload: PermissionPayload = serde_json::from_value(value).map_err(bad)?;
                Ok(ClientMessage::PermissionResponse {
                    conversation_id: payload.conversation_id,
                    tool_use_id: payload.tool_use_id,
                    allowed: payload.allowed,
                })
            }
            "slash_command" => {
                let payload: SlashPayload = serde_json::from_value(value).map_err(bad)?;
                Ok(ClientMessage::SlashCommand {
                    conversation_id: payload.conversation_id,
                    text: payload.text,
                })
            }
            other => Err(GatewayError::BadRequest(format!(
                "unknown message type '{}'",
                other
            ))),
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (sender, receiver) = socket.split();
    let formats = state.config().assistant.permission_formats.clone();
    let connection = Connection {
        state,
        sender,
        control: ControlPlane::new(formats),
        active: None,
    };
    run_socket_loop(connection, receiver).await;
}

/// The one turn a connection may be driving.
struct ActiveTurn {
    stream: TurnStream,
    conversation_id: String,
    started: Instant,
    text: String,
}

/// Per-connection state. Owns the control routing table, so control
/// messages only ever reach processes started by this connection.
struct Connection {
    state: SharedState,
    sender: SplitSink<WebSocket, Message>,
    control: ControlPlane,
    active: Option<ActiveTurn>,
}

/// The sink is gone; stop serving this connection.
struct Disconnected;

async fn next_turn_event(active: &mut Option<ActiveTurn>) -> Option<ProtocolEvent> {
    match active {
        Some(turn) => turn.stream.next_event().await,
        None => std::future::pending().await,
    }
}

/// Core WebSocket loop: client frames, turn events and ping/pong keepalive
/// in one select. If no Pong arrives within [`PONG_TIMEOUT`] after a Ping,
/// the connection is considered dead.
async fn run_socket_loop(mut conn: Connection, mut receiver: SplitStream<WebSocket>) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    if conn.send(&ServerMessage::Connected).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    info!("websocket pong timeout; closing");
                    break;
                }
                if conn.sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = next_turn_event(&mut conn.active) => {
                let result = match event {
                    Some(event) => conn.on_turn_event(event).await,
                    None => {
                        conn.end_active_turn();
                        Ok(())
                    }
                };
                if result.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if conn.on_client_text(text.as_str()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    if let Some(active) = conn.active.take() {
        info!(conversation_id = %active.conversation_id, "client disconnected mid-turn");
        match active.stream.abandon().await {
            Ok(outcome) => debug!(status = ?outcome.status, "abandoned turn closed"),
            Err(e) => warn!(error = %e, "failed to abandon turn"),
        }
    }

    // Best-effort close frame
    let _ = conn.sender.send(Message::Close(None)).await;
}

impl Connection {
    async fn send(&mut self, msg: &ServerMessage) -> Result<(), Disconnected> {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize server message");
                return Ok(());
            }
        };
        self.sender
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| Disconnected)
    }

    async fn on_client_text(&mut self, text: &str) -> Result<(), Disconnected> {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                return self
                    .send(&ServerMessage::Error {
                        content: e.to_string(),
                    })
                    .await;
            }
        };

        match message {
            ClientMessage::Ping => self.send(&ServerMessage::Pong).await,
            ClientMessage::Chat(req) => self.start_chat(req).await,
            ClientMessage::PermissionResponse {
                conversation_id,
                tool_use_id,
                allowed,
            } => {
                let control = ControlMessage::PermissionResponse {
                    tool_use_id,
                    allowed,
                };
                self.forward_control(conversation_id, control).await
            }
            ClientMessage::SlashCommand {
                conversation_id,
                text,
            } => {
                self.forward_control(conversation_id, ControlMessage::SlashCommand { text })
                    .await
            }
        }
    }

    async fn start_chat(&mut self, req: ChatRequest) -> Result<(), Disconnected> {
        if let Some(active) = &self.active {
            let err = GatewayError::TurnInProgress {
                conversation_id: active.conversation_id.clone(),
            };
            return self
                .send(&ServerMessage::Warning {
                    content: err.to_string(),
                })
                .await;
        }

        let turn = match prepare_turn(&self.state, req).await {
            Ok(turn) => turn,
            Err(e) => {
                return self
                    .send(&ServerMessage::Error {
                        content: e.to_string(),
                    })
                    .await;
            }
        };

        let conversation_id = turn.conversation_id.clone();
        self.send(&ServerMessage::Start {
            conversation_id: conversation_id.clone(),
        })
        .await?;

        let stream = self.state.orchestrator.start_turn(turn);
        self.control.attach(&conversation_id, stream.process_slot());
        self.active = Some(ActiveTurn {
            stream,
            conversation_id,
            started: Instant::now(),
            text: String::new(),
        });
        Ok(())
    }

    async fn forward_control(
        &mut self,
        conversation_id: Option<String>,
        message: ControlMessage,
    ) -> Result<(), Disconnected> {
        let conversation_id = conversation_id
            .or_else(|| self.active.as_ref().map(|a| a.conversation_id.clone()))
            .unwrap_or_default();
        match self.control.dispatch(&conversation_id, &message) {
            ControlDelivery::Delivered { .. } => Ok(()),
            ControlDelivery::NoLiveProcess => {
                self.send(&ServerMessage::Warning {
                    content: "No live assistant process for this conversation; control message dropped"
                        .to_string(),
                })
                .await
            }
        }
    }

    async fn on_turn_event(&mut self, event: ProtocolEvent) -> Result<(), Disconnected> {
        match event {
            ProtocolEvent::FinalResult { .. } => {
                let result_text = match &event {
                    ProtocolEvent::FinalResult { text, .. } => text.clone(),
                    _ => String::new(),
                };
                self.send(&ServerMessage::from(event)).await?;

                let Some(active) = self.active.take() else {
                    return Ok(());
                };
                let elapsed = round_secs(active.started.elapsed());
                let text = if active.text.is_empty() {
                    result_text
                } else {
                    active.text.clone()
                };
                if let Err(e) = save_reply(&self.state.db, &active.conversation_id, text, elapsed).await {
                    warn!(conversation_id = %active.conversation_id, error = %e, "failed to save reply");
                }
                let done = ServerMessage::Done {
                    elapsed,
                    conversation_id: active.conversation_id.clone(),
                };
                self.retire(active);
                self.send(&done).await
            }
            ProtocolEvent::StreamError { .. } => {
                self.send(&ServerMessage::from(event)).await?;
                if let Some(active) = self.active.take() {
                    self.retire(active);
                }
                Ok(())
            }
            event => {
                if let (ProtocolEvent::AssistantText { text }, Some(active)) = (&event, self.active.as_mut()) {
                    active.text.push_str(text);
                }
                self.send(&ServerMessage::from(event)).await
            }
        }
    }

    /// The stream ended without a terminal event, which only happens when the
    /// turn was abandoned.
    fn end_active_turn(&mut self) {
        if let Some(active) = self.active.take() {
            self.retire(active);
        }
    }

    /// Stop routing control messages to the turn and reap it in the
    /// background; its process may still be exiting.
    fn retire(&mut self, active: ActiveTurn) {
        self.control.detach(&active.conversation_id);
        let conversation_id = active.conversation_id;
        tokio::spawn(async move {
            match active.stream.finish().await {
                Ok(outcome) => {
                    if let Some(exit) = &outcome.exit
                        && !exit.success()
                        && outcome.status == TurnStatus::Completed
                    {
                        warn!(conversation_id = %conversation_id, exit = %exit.describe(), "assistant exited abnormally after completing");
                    }
                    debug!(conversation_id = %conversation_id, status = ?outcome.status, "turn reaped");
                }
                Err(e) => warn!(conversation_id = %conversation_id, error = %e, "turn task failed"),
            }
        });
    }
}

// ── Tests ────────────────────────────────────────────────────────────
