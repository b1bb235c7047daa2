//! HTTP and WebSocket front end.

pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::db::{DbHandle, GatewayDb, MessageRole};
use crate::errors::GatewayError;
use crate::orchestrator::turn::conversation_title;
use crate::orchestrator::{Orchestrator, Turn, TurnStatus, generate_conversation_id};
use crate::session::SessionStore;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub db: DbHandle,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the orchestrator to the database-backed session store.
    pub fn new(config: Arc<GatewayConfig>, db: DbHandle) -> Self {
        let sessions: Arc<dyn SessionStore> = Arc::new(db.clone());
        Self {
            orchestrator: Orchestrator::new(config, sessions),
            db,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        self.orchestrator.config()
    }
}

// ── Request payload types ─────────────────────────────────────────────

/// A chat request, shared by `POST /api/chat` and the WebSocket `chat` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub file_ids: Vec<String>,
    pub conversation_id: Option<String>,
    pub model: Option<String>,
    pub search_context: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub model: String,
    pub elapsed: f64,
    pub conversation_id: String,
}

/// Validate a request, make sure its conversation exists and persist the
/// user message. Nothing is spawned here.
pub async fn prepare_turn(state: &AppState, req: ChatRequest) -> Result<Turn, GatewayError> {
    let conversation_id = req
        .conversation_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(generate_conversation_id);
    let turn = Turn::new(conversation_id, req.message.trim())
        .with_attachments(req.file_ids)
        .with_model(req.model)
        .with_search_context(req.search_context);
    turn.validate(state.config().limits.max_input_length)?;

    let id = turn.conversation_id.clone();
    let title = conversation_title(&turn.message);
    let message = turn.message.clone();
    state
        .db
        .call(move |db| {
            if db.ensure_conversation(&id, &title)? {
                info!(conversation_id = %id, "created conversation");
            }
            db.save_message(&id, MessageRole::User, &message, None)?;
            Ok(())
        })
        .await
        .map_err(GatewayError::Database)?;
    Ok(turn)
}

/// Persist the assistant's reply.
pub async fn save_reply(
    db: &DbHandle,
    conversation_id: &str,
    text: String,
    elapsed: f64,
) -> Result<(), GatewayError> {
    let id = conversation_id.to_string();
    db.call(move |db| {
        db.save_message(&id, MessageRole::Assistant, &text, Some(elapsed))
            .map(|_| ())
    })
    .await
    .map_err(GatewayError::Database)
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::EmptyMessage
            | GatewayError::MessageTooLong { .. }
            | GatewayError::BadRequest(_) => ApiError::BadRequest(err.to_string()),
            GatewayError::TurnInProgress { .. } => ApiError::Conflict(err.to_string()),
            other => {
                error!(error = %other, "request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let admission = state.orchestrator.admission();
    Json(serde_json::json!({
        "status": "ok",
        "model": state.config().assistant.model,
        "max_concurrent": admission.capacity(),
        "active_turns": admission.in_use(),
    }))
}

/// Run one turn to completion and return the full reply.
async fn chat(
    State(state): State<SharedState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let turn = prepare_turn(&state, req).await?;
    let model = turn
        .model
        .clone()
        .unwrap_or_else(|| state.config().assistant.model.clone());

    let outcome = state
        .orchestrator
        .run_to_completion(turn)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    match outcome.status {
        TurnStatus::Completed => {
            let elapsed = outcome.elapsed_secs();
            if let Err(e) = save_reply(&state.db, &outcome.conversation_id, outcome.text.clone(), elapsed).await {
                warn!(conversation_id = %outcome.conversation_id, error = %e, "failed to save reply");
            }
            Ok(Json(ChatResponse {
                response: outcome.text,
                model,
                elapsed,
                conversation_id: outcome.conversation_id,
            }))
        }
        TurnStatus::Failed(message) => Err(ApiError::BadGateway(message)),
        TurnStatus::Abandoned => Err(ApiError::Internal("Turn was abandoned".to_string())),
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/health", get(health))
        .route("/api/chat", post(chat))
        .with_state(state)
}

/// Open storage, build the router and serve until Ctrl-C.
pub async fn start_server(config: Arc<GatewayConfig>) -> Result<()> {
    let db_path = &config.storage.db_path;
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    std::fs::create_dir_all(&config.storage.upload_dir)
        .context("Failed to create upload directory")?;

    let db = GatewayDb::new(db_path).context("Failed to initialize gateway database")?;
    let state = Arc::new(AppState::new(config.clone(), DbHandle::new(db)));
    let admission = state.orchestrator.admission().clone();

    let mut app = build_router(state);
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(
        address = %local_addr,
        assistant = %config.assistant.command,
        max_concurrent = config.limits.max_concurrent,
        "gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    admission.close();
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let mut config = GatewayConfig::default();
        config.assistant.command = "/nonexistent/assistant".to_string();
        config.normalize();
        let db = DbHandle::new(GatewayDb::new_in_memory().unwrap());
        Arc::new(AppState::new(Arc::new(config), db))
    }

    async fn post_chat(app: Router, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = build_router(test_state());
        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["max_concurrent"], 3);
        assert_eq!(body["active_turns"], 0);
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_message() {
        let (status, body) = post_chat(build_router(test_state()), serde_json::json!({"message": "  "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Empty message");
    }

    #[tokio::test]
    async fn test_chat_rejects_long_message() {
        let long = "x".repeat(10_001);
        let (status, body) =
            post_chat(build_router(test_state()), serde_json::json!({"message": long})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Message too long (max 10000)");
    }

    #[tokio::test]
    async fn test_chat_spawn_failure_is_bad_gateway() {
        let state = test_state();
        let (status, body) = post_chat(
            build_router(state.clone()),
            serde_json::json!({"message": "hi", "conversation_id": "c_test"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("/nonexistent/assistant"));

        // The user message was saved before the process was started
        let messages = state
            .db
            .call(|db| db.get_messages("c_test"))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[tokio::test]
    async fn test_prepare_turn_generates_conversation() {
        let state = test_state();
        let turn = prepare_turn(
            &state,
            ChatRequest {
                message: "  What is the weather like on Mars in the summer season?  ".into(),
                ..ChatRequest::default()
            },
        )
        .await
        .unwrap();
        assert!(turn.conversation_id.starts_with("c_"));
        assert_eq!(turn.message, "What is the weather like on Mars in the summer season?");

        let id = turn.conversation_id.clone();
        let conv = state
            .db
            .call(move |db| db.get_conversation(&id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conv.title, "What is the weather like on Mars in the ...");
    }

    #[test]
    fn test_gateway_error_status_mapping() {
        let resp = ApiError::from(GatewayError::TurnInProgress {
            conversation_id: "c".into(),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = ApiError::from(GatewayError::LockPoisoned).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
