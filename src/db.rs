use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::errors::GatewayError;
use crate::session::SessionStore;

/// Async-safe handle to the gateway database.
///
/// Wraps `GatewayDb` behind `Arc<Mutex>` and runs every access on tokio's
/// blocking pool via `spawn_blocking`, so SQLite I/O never stalls the
/// runtime's worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<GatewayDb>>,
}

impl DbHandle {
    pub fn new(db: GatewayDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&GatewayDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| GatewayError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub elapsed: Option<f64>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct GatewayDb {
    conn: Connection,
}

impl GatewayDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                elapsed REAL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_mappings (
                conversation_id TEXT PRIMARY KEY,
                session_token TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
            ",
        )?;
        Ok(())
    }

    /// Create the conversation if it does not exist. Returns true if created.
    pub fn ensure_conversation(&self, id: &str, title: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO conversations (id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![id, title, now],
            )
            .context("Failed to create conversation")?;
        Ok(inserted > 0)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.conn
            .query_row(
                "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to load conversation")
    }

    pub fn save_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        elapsed: Option<f64>,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO messages (conversation_id, role, content, elapsed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![conversation_id, role.as_str(), content, elapsed, now],
            )
            .with_context(|| format!("Failed to save message for {}", conversation_id))?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![now, conversation_id],
            )
            .context("Failed to touch conversation")?;
        Ok(id)
    }

    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, conversation_id, role, content, elapsed, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY id",
        )?;
        let messages = stmt
            .query_map(params![conversation_id], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    elapsed: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load messages")?;
        Ok(messages)
    }

    /// Last write wins.
    pub fn save_session_mapping(&self, conversation_id: &str, session_token: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO session_mappings (conversation_id, session_token, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    session_token = excluded.session_token,
                    updated_at = excluded.updated_at",
                params![conversation_id, session_token, now],
            )
            .context("Failed to save session mapping")?;
        Ok(())
    }

    pub fn get_session_mapping(&self, conversation_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT session_token FROM session_mappings WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load session mapping")
    }
}

#[async_trait]
impl SessionStore for DbHandle {
    async fn get(&self, conversation_id: &str) -> Result<Option<String>> {
        let conversation_id = conversation_id.to_string();
        self.call(move |db| db.get_session_mapping(&conversation_id))
            .await
    }

    async fn put(&self, conversation_id: &str, session_token: &str) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        let session_token = session_token.to_string();
        self.call(move |db| db.save_session_mapping(&conversation_id, &session_token))
            .await
    }
}
