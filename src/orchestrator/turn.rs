//! Turn requests and their outcomes.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use super::process::ExitInfo;
use crate::errors::GatewayError;

const TITLE_CHARS: usize = 40;

/// One user request to the assistant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Turn {
    pub conversation_id: String,
    pub message: String,
    /// Bare file names inside the upload directory
    pub attachments: Vec<String>,
    /// Overrides the configured model
    pub model: Option<String>,
    /// Overrides the stored session token
    pub resume_token: Option<String>,
    /// Text prepended ahead of the user's question
    pub search_context: Option<String>,
}

impl Turn {
    pub fn new(conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_resume_token(mut self, token: Option<String>) -> Self {
        self.resume_token = token;
        self
    }

    pub fn with_search_context(mut self, context: Option<String>) -> Self {
        self.search_context = context.filter(|c| !c.trim().is_empty());
        self
    }

    /// Reject requests that must not start a process.
    pub fn validate(&self, max_input_length: usize) -> Result<(), GatewayError> {
        if self.message.trim().is_empty() && self.attachments.is_empty() {
            return Err(GatewayError::EmptyMessage);
        }
        if self.message.chars().count() > max_input_length {
            return Err(GatewayError::MessageTooLong {
                max: max_input_length,
            });
        }
        Ok(())
    }
}

/// `c_<unix seconds>_<4 hex>`
pub fn generate_conversation_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("c_{}_{}", Utc::now().timestamp(), &suffix[..4])
}

/// First 40 characters of the opening message.
pub fn conversation_title(message: &str) -> String {
    let message = message.trim();
    if message.chars().count() > TITLE_CHARS {
        let head: String = message.chars().take(TITLE_CHARS).collect();
        format!("{}...", head)
    } else {
        message.to_string()
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    Failed(String),
    /// The caller went away; nothing was emitted for the ending
    Abandoned,
}

/// Produced once a turn's execution has fully ended and its process is reaped.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: String,
    pub status: TurnStatus,
    /// Response text worth persisting; empty for abandoned turns
    pub text: String,
    pub session_token: Option<String>,
    /// `None` when no process was started
    pub exit: Option<ExitInfo>,
    pub elapsed: Duration,
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == TurnStatus::Completed
    }

    /// Seconds rounded to two decimals.
    pub fn elapsed_secs(&self) -> f64 {
        round_secs(self.elapsed)
    }
}

pub fn round_secs(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}
