use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ColloquyError;

/// Current time truncated to the microsecond precision timestamps are stored with.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

// =============================================================================
// Enums
// =============================================================================

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
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

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = ColloquyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(ColloquyError::Storage(format!(
                "unknown message role '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle status of a message.
///
/// Streamed snapshots are `Pending`. A persisted assistant message is
/// `Complete` when generation finished normally and `Incomplete` when it
/// was cut short by a generation failure or a disconnected caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    #[default]
    Complete,
    Incomplete,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Complete => "complete",
            MessageStatus::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = ColloquyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(MessageStatus::Pending),
            "complete" => Ok(MessageStatus::Complete),
            "incomplete" => Ok(MessageStatus::Incomplete),
            other => Err(ColloquyError::Storage(format!(
                "unknown message status '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// Documents
// =============================================================================

/// An ingested source document.
///
/// `url` is the natural key: upserting an existing url updates the
/// metadata of the existing record instead of creating a second one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub url: Option<String>,
    /// Arbitrary-depth metadata mapping.
    pub metadata_map: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Human-readable label: the `name` metadata entry, else the url, else the id.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.metadata_map.get("name").and_then(|v| v.as_str()) {
            return name.to_string();
        }
        match &self.url {
            Some(url) => url.clone(),
            None => self.id.to_string(),
        }
    }
}

/// Filter for document lookups.
///
/// An `id` forces a limit of one. `ids` filters by membership, `url` by
/// exact match. All filters combine with AND.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DocumentQuery {
    pub id: Option<Uuid>,
    pub ids: Option<Vec<Uuid>>,
    pub url: Option<String>,
    pub limit: Option<u64>,
}

impl DocumentQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: Uuid) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_ids(ids: Vec<Uuid>) -> Self {
        Self {
            ids: Some(ids),
            ..Self::default()
        }
    }

    pub fn by_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Limit after applying the single-id rule.
    pub fn effective_limit(&self) -> Option<u64> {
        if self.id.is_some() {
            Some(1)
        } else {
            self.limit
        }
    }
}

// =============================================================================
// Conversations
// =============================================================================

/// A recorded processing step that contributed to an assistant message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubProcess {
    pub id: Uuid,
    pub message_id: Uuid,
    /// Free-form tag such as `retrieval` or `tool_call`.
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A sub-process produced by generation that has not been persisted yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewSubProcess {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl NewSubProcess {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// One turn of a conversation with its ordered sub-processes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    pub sub_processes: Vec<SubProcess>,
    pub created_at: DateTime<Utc>,
}

/// The assembled conversation aggregate returned to callers.
///
/// Messages are in creation order and each message's sub-processes are in
/// creation order. `documents` holds the full linked documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub documents: Vec<Document>,
}

impl Conversation {
    pub fn document_ids(&self) -> Vec<Uuid> {
        self.documents.iter().map(|d| d.id).collect()
    }
}

/// Request body for conversation creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationCreate {
    #[serde(default)]
    pub document_ids: Vec<Uuid>,
}
