use crate::domain::models::ChatMessage;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const CONVERSATION_KEY: &str = "chat_messages";

/// Durable blob storage for the assistant conversation.
pub trait MessageStorage: Send + Sync {
    fn save_messages(&self, messages: &[ChatMessage]) -> Result<(), InfraError>;
    fn load_messages(&self) -> Result<Option<Vec<ChatMessage>>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteMessageStorage {
    db_path: PathBuf,
    key: String,
}

impl SqliteMessageStorage {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            key: CONVERSATION_KEY.to_string(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }
}

impl MessageStorage for SqliteMessageStorage {
    fn save_messages(&self, messages: &[ChatMessage]) -> Result<(), InfraError> {
        let payload = serde_json::to_string(messages)?;
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO preferences (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               updated_at = excluded.updated_at",
            params![self.key, payload, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn load_messages(&self) -> Result<Option<Vec<ChatMessage>>, InfraError> {
        let connection = self.connect()?;
        let payload: Option<String> = connection
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                params![self.key],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        let messages = serde_json::from_str(&payload).map_err(|error| {
            InfraError::Storage(format!("invalid stored conversation '{}': {error}", self.key))
        })?;
        Ok(Some(messages))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMessageStorage {
    messages: Mutex<Option<Vec<ChatMessage>>>,
}

impl InMemoryMessageStorage {
    pub fn with_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages: Mutex::new(Some(messages)),
        }
    }
}

impl MessageStorage for InMemoryMessageStorage {
    fn save_messages(&self, messages: &[ChatMessage]) -> Result<(), InfraError> {
        let mut stored = self
            .messages
            .lock()
            .map_err(|error| InfraError::Storage(format!("message storage lock poisoned: {error}")))?;
        *stored = Some(messages.to_vec());
        Ok(())
    }

    fn load_messages(&self) -> Result<Option<Vec<ChatMessage>>, InfraError> {
        let stored = self
            .messages
            .lock()
            .map_err(|error| InfraError::Storage(format!("message storage lock poisoned: {error}")))?;
        Ok(stored.clone())
    }
}
