//! Colloquy storage crate - SQLite persistence for documents and conversations.
//!
//! Provides a WAL-mode SQLite database with migrations and the two store
//! collaborators the chat layer depends on: [`DocumentStore`] and
//! [`ConversationStore`]. Stores expose the normalized row shape; assembling
//! the nested conversation view is the chat layer's job.

pub mod db;
pub mod migrations;
pub mod records;
pub mod repository;

use uuid::Uuid;

use colloquy_core::error::Result;
use colloquy_core::types::{Document, DocumentQuery, SubProcess};

pub use db::Database;
pub use records::{ConversationRecord, ConversationRows, MessageRecord};
pub use repository::{ConversationRepository, DocumentRepository};

/// Document persistence keyed by id and by url.
pub trait DocumentStore: Send + Sync {
    /// Fetch documents matching every filter set on `query`, in creation order.
    fn fetch_documents(&self, query: &DocumentQuery) -> Result<Vec<Document>>;

    /// Create a document for `url`, or replace the metadata of the existing one.
    fn upsert_document_by_url(
        &self,
        url: &str,
        metadata_map: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Document>;

    fn count_documents(&self) -> Result<u64>;
}

/// Conversation, message, sub-process and link-row persistence.
pub trait ConversationStore: Send + Sync {
    /// Insert a conversation and one link row per document id atomically.
    fn create_conversation(&self, document_ids: &[Uuid]) -> Result<ConversationRecord>;

    /// Read every row belonging to a conversation in one consistent snapshot.
    fn load_conversation(&self, conversation_id: Uuid) -> Result<Option<ConversationRows>>;

    fn conversation_exists(&self, conversation_id: Uuid) -> Result<bool>;

    /// Delete a conversation and, by cascade, everything it owns.
    /// Returns whether a row existed.
    fn delete_conversation(&self, conversation_id: Uuid) -> Result<bool>;

    fn insert_message(&self, message: &MessageRecord) -> Result<()>;

    /// Insert a message and its sub-processes as a single durable unit.
    fn insert_message_with_sub_processes(
        &self,
        message: &MessageRecord,
        sub_processes: &[SubProcess],
    ) -> Result<()>;

    /// Fetch one message with its ordered sub-processes.
    fn find_message(&self, message_id: Uuid) -> Result<Option<(MessageRecord, Vec<SubProcess>)>>;

    fn count_conversations(&self) -> Result<u64>;
}
