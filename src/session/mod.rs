//! Conversation to assistant-session mapping.
//!
//! The orchestrator reads the mapping before launching a turn and writes it as
//! soon as the assistant announces its session. Writes for one conversation
//! are last-write-wins; different conversations never interfere.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Storage for resume tokens, keyed by conversation id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, conversation_id: &str) -> Result<Option<String>>;

    async fn put(&self, conversation_id: &str, session_token: &str) -> Result<()>;
}

/// Process-local store, used by `ask` and in tests.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, String>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<String>> {
        Ok(self.sessions.read().await.get(conversation_id).cloned())
    }

    async fn put(&self, conversation_id: &str, session_token: &str) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(conversation_id.to_string(), session_token.to_string());
        Ok(())
    }
}
