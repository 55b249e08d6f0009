//! Flat row types returned by the conversation store.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use colloquy_core::types::{timestamp_now, MessageRole, MessageStatus, SubProcess};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    /// A new user message, stamped now.
    pub fn user(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::User,
            content: content.into(),
            status: MessageStatus::Complete,
            created_at: timestamp_now(),
        }
    }
}

/// Every row of one conversation, each relation loaded independently.
///
/// `messages` and `sub_processes` are in creation order. `document_ids`
/// follows link-row insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRows {
    pub conversation: ConversationRecord,
    pub messages: Vec<MessageRecord>,
    pub sub_processes: Vec<SubProcess>,
    pub document_ids: Vec<Uuid>,
}
