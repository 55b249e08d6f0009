//! Conversation aggregation.
//!
//! The store keeps conversations, messages, sub-processes and document
//! links as flat rows. [`ConversationBuilder`] merges those rows by foreign
//! key into the nested [`Conversation`] view, and [`ConversationAggregator`]
//! is the only way callers read or create conversations, so ordering and
//! completeness are enforced in exactly one place.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use colloquy_core::types::{Conversation, Document, DocumentQuery, Message, SubProcess};
use colloquy_storage::{ConversationRows, ConversationStore, DocumentStore, MessageRecord};

use crate::error::ChatError;

/// Run a synchronous store call on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, ChatError>
where
    T: Send + 'static,
    F: FnOnce() -> colloquy_core::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChatError::Internal(format!("storage task failed: {}", e)))?
        .map_err(ChatError::from)
}

// =============================================================================
// ConversationBuilder
// =============================================================================

/// Assembles one conversation aggregate from independently loaded relations.
pub struct ConversationBuilder {
    rows: ConversationRows,
    documents: Vec<Document>,
}

impl ConversationBuilder {
    pub fn new(rows: ConversationRows) -> Self {
        Self {
            rows,
            documents: Vec::new(),
        }
    }

    /// Attach the fetched documents. Link order is preserved; documents that
    /// are not linked to the conversation are ignored.
    pub fn documents(mut self, documents: Vec<Document>) -> Self {
        self.documents = documents;
        self
    }

    pub fn build(self) -> Result<Conversation, ChatError> {
        let ConversationRows {
            conversation,
            messages,
            sub_processes,
            document_ids,
        } = self.rows;

        let mut by_message: HashMap<Uuid, Vec<SubProcess>> = HashMap::new();
        for sub_process in sub_processes {
            by_message
                .entry(sub_process.message_id)
                .or_default()
                .push(sub_process);
        }

        let messages: Vec<Message> = messages
            .into_iter()
            .map(|record| {
                let sub_processes = by_message.remove(&record.id).unwrap_or_default();
                into_message(record, sub_processes)
            })
            .collect();

        // Every sub-process row must have found its message.
        if let Some(orphan) = by_message.keys().next() {
            return Err(ChatError::Internal(format!(
                "sub-processes reference message {} outside conversation {}",
                orphan, conversation.id
            )));
        }

        let mut documents_by_id: HashMap<Uuid, Document> =
            self.documents.into_iter().map(|d| (d.id, d)).collect();
        let documents = document_ids
            .iter()
            .filter_map(|id| documents_by_id.remove(id))
            .collect();

        Ok(Conversation {
            id: conversation.id,
            created_at: conversation.created_at,
            messages,
            documents,
        })
    }
}

pub(crate) fn into_message(record: MessageRecord, sub_processes: Vec<SubProcess>) -> Message {
    Message {
        id: record.id,
        conversation_id: record.conversation_id,
        role: record.role,
        content: record.content,
        status: record.status,
        sub_processes,
        created_at: record.created_at,
    }
}

// =============================================================================
// ConversationAggregator
// =============================================================================

/// Reads, creates and deletes conversations as complete aggregates.
#[derive(Clone)]
pub struct ConversationAggregator {
    conversations: Arc<dyn ConversationStore>,
    documents: Arc<dyn DocumentStore>,
}

impl ConversationAggregator {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            conversations,
            documents,
        }
    }

    /// Fetch the full conversation aggregate.
    pub async fn get_conversation(&self, conversation_id: Uuid) -> Result<Conversation, ChatError> {
        let store = Arc::clone(&self.conversations);
        let rows = run_blocking(move || store.load_conversation(conversation_id))
            .await?
            .ok_or(ChatError::ConversationNotFound(conversation_id))?;

        let documents = if rows.document_ids.is_empty() {
            Vec::new()
        } else {
            let store = Arc::clone(&self.documents);
            let query = DocumentQuery::by_ids(rows.document_ids.clone());
            run_blocking(move || store.fetch_documents(&query)).await?
        };

        debug!(
            conversation_id = %conversation_id,
            messages = rows.messages.len(),
            documents = documents.len(),
            "Conversation assembled"
        );

        ConversationBuilder::new(rows).documents(documents).build()
    }

    /// Create a conversation linked to `document_ids` and return it through
    /// the same assembly path as [`Self::get_conversation`].
    ///
    /// Unknown document ids are rejected before anything is written.
    pub async fn create_conversation(
        &self,
        document_ids: &[Uuid],
    ) -> Result<Conversation, ChatError> {
        let mut unique: Vec<Uuid> = Vec::with_capacity(document_ids.len());
        for id in document_ids {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }

        if !unique.is_empty() {
            let store = Arc::clone(&self.documents);
            let query = DocumentQuery::by_ids(unique.clone());
            let found = run_blocking(move || store.fetch_documents(&query)).await?;
            let missing: Vec<String> = unique
                .iter()
                .filter(|id| !found.iter().any(|d| d.id == **id))
                .map(Uuid::to_string)
                .collect();
            if !missing.is_empty() {
                return Err(ChatError::InvalidInput(format!(
                    "unknown document ids: {}",
                    missing.join(", ")
                )));
            }
        }

        let store = Arc::clone(&self.conversations);
        let record = run_blocking(move || store.create_conversation(&unique)).await?;
        info!(conversation_id = %record.id, "Conversation created");

        self.get_conversation(record.id).await
    }

    /// Delete a conversation and everything it owns. Returns whether it existed.
    pub async fn delete_conversation(&self, conversation_id: Uuid) -> Result<bool, ChatError> {
        let store = Arc::clone(&self.conversations);
        let deleted = run_blocking(move || store.delete_conversation(conversation_id)).await?;
        if deleted {
            info!(conversation_id = %conversation_id, "Conversation deleted");
        }
        Ok(deleted)
    }

    /// Fetch one message of a conversation with its sub-processes.
    pub async fn get_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> Result<Message, ChatError> {
        let store = Arc::clone(&self.conversations);
        match run_blocking(move || store.find_message(message_id)).await? {
            Some((record, sub_processes)) if record.conversation_id == conversation_id => {
                Ok(into_message(record, sub_processes))
            }
            _ => Err(ChatError::MessageNotFound(message_id)),
        }
    }

    pub async fn conversation_exists(&self, conversation_id: Uuid) -> Result<bool, ChatError> {
        let store = Arc::clone(&self.conversations);
        run_blocking(move || store.conversation_exists(conversation_id)).await
    }

    pub(crate) fn conversation_store(&self) -> Arc<dyn ConversationStore> {
        Arc::clone(&self.conversations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::types::{timestamp_now, MessageRole, MessageStatus};
    use colloquy_storage::{
        ConversationRecord, ConversationRepository, Database, DocumentRepository,
    };
    use serde_json::json;

    struct Fixture {
        aggregator: ConversationAggregator,
        conversations: Arc<ConversationRepository>,
        documents: Arc<DocumentRepository>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let conversations = Arc::new(ConversationRepository::new(Arc::clone(&db)));
        let documents = Arc::new(DocumentRepository::new(db));
        Fixture {
            aggregator: ConversationAggregator::new(conversations.clone(), documents.clone()),
            conversations,
            documents,
        }
    }

    fn add_document(documents: &DocumentRepository, url: &str) -> Document {
        let mut map = serde_json::Map::new();
        map.insert("name".to_string(), json!(url));
        documents.upsert_document_by_url(url, map).unwrap()
    }

    fn sub_process(message_id: Uuid, kind: &str) -> SubProcess {
        SubProcess {
            id: Uuid::new_v4(),
            message_id,
            kind: kind.to_string(),
            payload: json!({}),
            created_at: timestamp_now(),
        }
    }

    #[tokio::test]
    async fn test_create_then_get_are_identical() {
        let f = fixture();
        let d1 = add_document(&f.documents, "https://d1");
        let d2 = add_document(&f.documents, "https://d2");

        let created = f.aggregator.create_conversation(&[d1.id, d2.id]).await.unwrap();
        let fetched = f.aggregator.get_conversation(created.id).await.unwrap();

        assert_eq!(created, fetched);
        assert!(created.messages.is_empty());
        assert_eq!(created.document_ids(), vec![d1.id, d2.id]);
        assert_eq!(
            serde_json::to_vec(&created).unwrap(),
            serde_json::to_vec(&fetched).unwrap()
        );
    }

    #[tokio::test]
    async fn test_create_without_documents() {
        let f = fixture();
        let created = f.aggregator.create_conversation(&[]).await.unwrap();
        assert!(created.documents.is_empty());
        assert!(created.messages.is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_documents() {
        let f = fixture();
        let d1 = add_document(&f.documents, "https://d1");
        let unknown = Uuid::new_v4();

        let err = f
            .aggregator
            .create_conversation(&[d1.id, unknown])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidInput(ref m) if m.contains(&unknown.to_string())));
        assert_eq!(f.conversations.count_conversations().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let f = fixture();
        let id = Uuid::new_v4();
        let err = f.aggregator.get_conversation(id).await.unwrap_err();
        assert!(matches!(err, ChatError::ConversationNotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn test_messages_and_sub_processes_nested_in_order() {
        let f = fixture();
        let convo = f.aggregator.create_conversation(&[]).await.unwrap();

        let mut expected_ids = Vec::new();
        for turn in 0..3 {
            let user = MessageRecord::user(convo.id, format!("question {}", turn));
            f.conversations.insert_message(&user).unwrap();
            expected_ids.push(user.id);

            let reply = MessageRecord {
                id: Uuid::new_v4(),
                conversation_id: convo.id,
                role: MessageRole::Assistant,
                content: format!("answer {}", turn),
                status: MessageStatus::Complete,
                created_at: timestamp_now(),
            };
            let steps = vec![sub_process(reply.id, "retrieval"), sub_process(reply.id, "synthesis")];
            f.conversations
                .insert_message_with_sub_processes(&reply, &steps)
                .unwrap();
            expected_ids.push(reply.id);
        }

        let fetched = f.aggregator.get_conversation(convo.id).await.unwrap();
        let ids: Vec<Uuid> = fetched.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, expected_ids);

        for message in &fetched.messages {
            match message.role {
                MessageRole::User => assert!(message.sub_processes.is_empty()),
                MessageRole::Assistant => {
                    let kinds: Vec<&str> =
                        message.sub_processes.iter().map(|s| s.kind.as_str()).collect();
                    assert_eq!(kinds, vec!["retrieval", "synthesis"]);
                    assert!(message.sub_processes.iter().all(|s| s.message_id == message.id));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let f = fixture();
        let convo = f.aggregator.create_conversation(&[]).await.unwrap();
        assert!(f.aggregator.delete_conversation(convo.id).await.unwrap());
        assert!(!f.aggregator.delete_conversation(convo.id).await.unwrap());
        assert!(f.aggregator.get_conversation(convo.id).await.is_err());
        assert!(!f.aggregator.delete_conversation(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_message_scoped_to_conversation() {
        let f = fixture();
        let a = f.aggregator.create_conversation(&[]).await.unwrap();
        let b = f.aggregator.create_conversation(&[]).await.unwrap();
        let user = MessageRecord::user(a.id, "hi");
        f.conversations.insert_message(&user).unwrap();

        let message = f.aggregator.get_message(a.id, user.id).await.unwrap();
        assert_eq!(message.content, "hi");

        let err = f.aggregator.get_message(b.id, user.id).await.unwrap_err();
        assert!(matches!(err, ChatError::MessageNotFound(_)));
    }

    #[test]
    fn test_builder_rejects_orphan_sub_process() {
        let conversation = ConversationRecord {
            id: Uuid::new_v4(),
            created_at: timestamp_now(),
        };
        let rows = ConversationRows {
            conversation,
            messages: vec![],
            sub_processes: vec![sub_process(Uuid::new_v4(), "retrieval")],
            document_ids: vec![],
        };
        assert!(matches!(
            ConversationBuilder::new(rows).build(),
            Err(ChatError::Internal(_))
        ));
    }

    #[test]
    fn test_builder_orders_documents_by_link() {
        let f = fixture();
        let d1 = add_document(&f.documents, "https://d1");
        let d2 = add_document(&f.documents, "https://d2");
        let rows = ConversationRows {
            conversation: ConversationRecord {
                id: Uuid::new_v4(),
                created_at: timestamp_now(),
            },
            messages: vec![],
            sub_processes: vec![],
            document_ids: vec![d2.id, d1.id],
        };

        let convo = ConversationBuilder::new(rows)
            .documents(vec![d1.clone(), d2.clone()])
            .build()
            .unwrap();
        assert_eq!(convo.document_ids(), vec![d2.id, d1.id]);
    }
}
