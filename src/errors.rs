//! Typed error hierarchy for the gateway.
//!
//! Three top-level enums cover the three layers:
//! - `ChannelError`: line-framed reading of the assistant's stdout
//! - `OrchestratorError`: spawning, writing to and timing out assistant processes
//! - `GatewayError`: request validation and persistence at the event sink

use thiserror::Error;

/// Errors from the line-framed JSON channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Assistant produced no output for {secs}s (timed out)")]
    IdleTimeout { secs: u64 },

    #[error("Assistant output too long: exceeded {limit} lines")]
    LineLimitExceeded { limit: usize },

    #[error("Assistant output line too long: exceeded {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Failed to read assistant output: {0}")]
    Io(#[source] std::io::Error),
}

/// Errors from the process orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Failed to spawn assistant process '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Assistant stdin is closed")]
    StdinClosed,

    #[error("Failed to write to assistant stdin: {0}")]
    StdinWrite(#[source] std::io::Error),

    #[error("Assistant did not accept input within {secs}s (timed out)")]
    StdinWriteTimeout { secs: u64 },

    #[error("Failed to serialize protocol message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Admission gate is closed")]
    AdmissionClosed,

    #[error("Turn exceeded time limit ({secs}s, timed out)")]
    TurnTimeout { secs: u64 },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced at the event sink and persistence boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Empty message")]
    EmptyMessage,

    #[error("Message too long (max {max})")]
    MessageTooLong { max: usize },

    #[error("A turn is already running for conversation {conversation_id}")]
    TurnInProgress { conversation_id: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Invalid request: {0}")]
    BadRequest(String),
}
