//! Conversation messages and the append-only message log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::character::AgentId;
use crate::error::WorldError;

/// Who wrote a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Author {
    /// A human participant, optionally named.
    User { name: Option<String> },
    /// A character.
    Agent { id: AgentId },
    /// No author (notices, scene-setting).
    System,
}

/// One entry in the conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub author: Author,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(author: Author, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_agent(id: AgentId, content: impl Into<String>) -> Self {
        Self::new(Author::Agent { id }, content)
    }

    pub fn from_user(name: Option<String>, content: impl Into<String>) -> Self {
        Self::new(Author::User { name }, content)
    }

    pub fn agent_id(&self) -> Option<&AgentId> {
        match &self.author {
            Author::Agent { id } => Some(id),
            _ => None,
        }
    }
}

/// Ordered, append-only record of conversation turns.
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn append(&self, message: Message) -> Result<(), WorldError>;

    /// A fresh snapshot of the whole log, oldest first.
    async fn list(&self) -> Result<Vec<Message>, WorldError>;
}

/// Message log kept in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryMessageLog {
    messages: RwLock<Vec<Message>>,
}

impl InMemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageLog for InMemoryMessageLog {
    async fn append(&self, message: Message) -> Result<(), WorldError> {
        self.messages.write().await.push(message);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Message>, WorldError> {
        Ok(self.messages.read().await.clone())
    }
}

/// Message log persisted as one JSON object per line.
#[derive(Debug)]
pub struct JsonlMessageLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlMessageLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageLog for JsonlMessageLog {
    async fn append(&self, message: Message) -> Result<(), WorldError> {
        let mut line = serde_json::to_string(&message)
            .map_err(|e| WorldError::MessageLog(format!("Failed to encode message: {}", e)))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                WorldError::MessageLog(format!("Failed to open {}: {}", self.path.display(), e))
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| WorldError::MessageLog(format!("Failed to write message: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| WorldError::MessageLog(format!("Failed to flush log: {}", e)))
    }

    async fn list(&self) -> Result<Vec<Message>, WorldError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(WorldError::MessageLog(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| {
                    WorldError::MessageLog(format!("Corrupt entry on line {}: {}", i + 1, e))
                })
            })
            .collect()
    }
}
