//! Repository implementations for SQLite-backed persistence.
//!
//! Provides DocumentRepository and ConversationRepository that operate on
//! the Database struct using raw SQL and implement the store traits.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use colloquy_core::error::{ColloquyError, Result};
use colloquy_core::types::{timestamp_now, Document, DocumentQuery, SubProcess};

use crate::db::Database;
use crate::records::{ConversationRecord, ConversationRows, MessageRecord};
use crate::{ConversationStore, DocumentStore};

const DOCUMENT_COLUMNS: &str = "id, url, metadata_map, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, status, created_at";

fn storage(context: &str, e: rusqlite::Error) -> ColloquyError {
    ColloquyError::Storage(format!("{}: {}", context, e))
}

// =============================================================================
// DocumentRepository
// =============================================================================

/// Repository for ingested documents.
#[derive(Clone)]
pub struct DocumentRepository {
    db: Arc<Database>,
}

impl DocumentRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl DocumentStore for DocumentRepository {
    fn fetch_documents(&self, query: &DocumentQuery) -> Result<Vec<Document>> {
        if matches!(&query.ids, Some(ids) if ids.is_empty()) {
            return Ok(Vec::new());
        }

        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(id) = query.id {
            clauses.push("id = ?".to_string());
            values.push(id.to_string().into());
        }
        if let Some(ref ids) = query.ids {
            let placeholders = vec!["?"; ids.len()].join(", ");
            clauses.push(format!("id IN ({})", placeholders));
            values.extend(ids.iter().map(|id| id.to_string().into()));
        }
        if let Some(ref url) = query.url {
            clauses.push("url = ?".to_string());
            values.push(url.clone().into());
        }

        let mut sql = format!("SELECT {} FROM documents", DOCUMENT_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC");
        if let Some(limit) = query.effective_limit() {
            sql.push_str(" LIMIT ?");
            values.push((limit.min(i64::MAX as u64) as i64).into());
        }

        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| storage("Failed to prepare document query", e))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                    Ok(row_to_document(row))
                })
                .map_err(|e| storage("Failed to fetch documents", e))?;

            let mut documents = Vec::new();
            for row in rows {
                documents.push(row.map_err(|e| storage("Failed to read document", e))??);
            }
            Ok(documents)
        })
    }

    fn upsert_document_by_url(
        &self,
        url: &str,
        metadata_map: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Document> {
        let metadata = serde_json::to_string(&metadata_map)?;
        let now = timestamp_now().timestamp_micros();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO documents (id, url, metadata_map, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(url) DO UPDATE SET
                    metadata_map = excluded.metadata_map,
                    updated_at = excluded.updated_at",
                params![Uuid::new_v4().to_string(), url, metadata, now],
            )
            .map_err(|e| storage("Failed to upsert document", e))?;

            conn.query_row(
                &format!("SELECT {} FROM documents WHERE url = ?1", DOCUMENT_COLUMNS),
                params![url],
                |row| Ok(row_to_document(row)),
            )
            .map_err(|e| storage("Failed to read upserted document", e))?
        })
    }

    fn count_documents(&self) -> Result<u64> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
                .map_err(|e| storage("Failed to count documents", e))?;
            Ok(count as u64)
        })
    }
}

// =============================================================================
// ConversationRepository
// =============================================================================

/// Repository for conversations and everything they own.
#[derive(Clone)]
pub struct ConversationRepository {
    db: Arc<Database>,
}

impl ConversationRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl ConversationStore for ConversationRepository {
    fn create_conversation(&self, document_ids: &[Uuid]) -> Result<ConversationRecord> {
        let record = ConversationRecord {
            id: Uuid::new_v4(),
            created_at: timestamp_now(),
        };

        self.db.transaction("conversation insert", |tx| {
            tx.execute(
                "INSERT INTO conversations (id, created_at) VALUES (?1, ?2)",
                params![record.id.to_string(), record.created_at.timestamp_micros()],
            )
            .map_err(|e| storage("Failed to insert conversation", e))?;

            for document_id in document_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO conversation_documents (conversation_id, document_id)
                     VALUES (?1, ?2)",
                    params![record.id.to_string(), document_id.to_string()],
                )
                .map_err(|e| storage("Failed to link document", e))?;
            }
            Ok(())
        })?;

        Ok(record)
    }

    fn load_conversation(&self, conversation_id: Uuid) -> Result<Option<ConversationRows>> {
        let id = conversation_id.to_string();

        // One transaction so all relations come from the same snapshot.
        self.db.transaction("conversation read", |tx| {
            let conversation = tx
                .query_row(
                    "SELECT id, created_at FROM conversations WHERE id = ?1",
                    params![id],
                    |row| Ok(row_to_conversation(row)),
                )
                .optional()
                .map_err(|e| storage("Failed to fetch conversation", e))?;

            let conversation = match conversation {
                Some(record) => record?,
                None => return Ok(None),
            };

            let messages = {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT {} FROM messages
                         WHERE conversation_id = ?1
                         ORDER BY rowid ASC",
                        MESSAGE_COLUMNS
                    ))
                    .map_err(|e| storage("Failed to prepare message query", e))?;
                let rows = stmt
                    .query_map(params![id], |row| Ok(row_to_message(row)))
                    .map_err(|e| storage("Failed to fetch messages", e))?;
                let mut messages = Vec::new();
                for row in rows {
                    messages.push(row.map_err(|e| storage("Failed to read message", e))??);
                }
                messages
            };

            let sub_processes = {
                let mut stmt = tx
                    .prepare(
                        "SELECT sp.id, sp.message_id, sp.kind, sp.payload, sp.created_at
                         FROM sub_processes sp
                         JOIN messages m ON m.id = sp.message_id
                         WHERE m.conversation_id = ?1
                         ORDER BY sp.rowid ASC",
                    )
                    .map_err(|e| storage("Failed to prepare sub-process query", e))?;
                let rows = stmt
                    .query_map(params![id], |row| Ok(row_to_sub_process(row)))
                    .map_err(|e| storage("Failed to fetch sub-processes", e))?;
                let mut sub_processes = Vec::new();
                for row in rows {
                    sub_processes
                        .push(row.map_err(|e| storage("Failed to read sub-process", e))??);
                }
                sub_processes
            };

            let document_ids = {
                let mut stmt = tx
                    .prepare(
                        "SELECT document_id FROM conversation_documents
                         WHERE conversation_id = ?1
                         ORDER BY rowid ASC",
                    )
                    .map_err(|e| storage("Failed to prepare link query", e))?;
                let rows = stmt
                    .query_map(params![id], |row| row.get::<_, String>(0))
                    .map_err(|e| storage("Failed to fetch document links", e))?;
                let mut document_ids = Vec::new();
                for row in rows {
                    let raw = row.map_err(|e| storage("Failed to read document link", e))?;
                    document_ids.push(parse_uuid(&raw)?);
                }
                document_ids
            };

            Ok(Some(ConversationRows {
                conversation,
                messages,
                sub_processes,
                document_ids,
            }))
        })
    }

    fn conversation_exists(&self, conversation_id: Uuid) -> Result<bool> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
                params![conversation_id.to_string()],
                |row| row.get::<_, bool>(0),
            )
            .map_err(|e| storage("Failed to check conversation", e))
        })
    }

    fn delete_conversation(&self, conversation_id: Uuid) -> Result<bool> {
        self.db.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM conversations WHERE id = ?1",
                    params![conversation_id.to_string()],
                )
                .map_err(|e| storage("Failed to delete conversation", e))?;
            Ok(deleted > 0)
        })
    }

    fn insert_message(&self, message: &MessageRecord) -> Result<()> {
        self.db.with_conn(|conn| insert_message_row(conn, message))
    }

    fn insert_message_with_sub_processes(
        &self,
        message: &MessageRecord,
        sub_processes: &[SubProcess],
    ) -> Result<()> {
        self.db.transaction("message insert", |tx| {
            insert_message_row(tx, message)?;
            for sub_process in sub_processes {
                if sub_process.message_id != message.id {
                    return Err(ColloquyError::InvalidInput(format!(
                        "sub-process {} belongs to message {}, not {}",
                        sub_process.id, sub_process.message_id, message.id
                    )));
                }
                tx.execute(
                    "INSERT INTO sub_processes (id, message_id, kind, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        sub_process.id.to_string(),
                        sub_process.message_id.to_string(),
                        sub_process.kind,
                        serde_json::to_string(&sub_process.payload)?,
                        sub_process.created_at.timestamp_micros(),
                    ],
                )
                .map_err(|e| storage("Failed to insert sub-process", e))?;
            }
            Ok(())
        })
    }

    fn find_message(&self, message_id: Uuid) -> Result<Option<(MessageRecord, Vec<SubProcess>)>> {
        let id = message_id.to_string();

        self.db.with_conn(|conn| {
            let message = conn
                .query_row(
                    &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                    params![id],
                    |row| Ok(row_to_message(row)),
                )
                .optional()
                .map_err(|e| storage("Failed to fetch message", e))?;

            let message = match message {
                Some(record) => record?,
                None => return Ok(None),
            };

            let mut stmt = conn
                .prepare(
                    "SELECT id, message_id, kind, payload, created_at FROM sub_processes
                     WHERE message_id = ?1
                     ORDER BY rowid ASC",
                )
                .map_err(|e| storage("Failed to prepare sub-process query", e))?;
            let rows = stmt
                .query_map(params![id], |row| Ok(row_to_sub_process(row)))
                .map_err(|e| storage("Failed to fetch sub-processes", e))?;
            let mut sub_processes = Vec::new();
            for row in rows {
                sub_processes.push(row.map_err(|e| storage("Failed to read sub-process", e))??);
            }

            Ok(Some((message, sub_processes)))
        })
    }

    fn count_conversations(&self) -> Result<u64> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
                .map_err(|e| storage("Failed to count conversations", e))?;
            Ok(count as u64)
        })
    }
}

// =============================================================================
// Row helpers
// =============================================================================

fn insert_message_row(conn: &rusqlite::Connection, message: &MessageRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, conversation_id, role, content, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            message.id.to_string(),
            message.conversation_id.to_string(),
            message.role.as_str(),
            message.content,
            message.status.as_str(),
            message.created_at.timestamp_micros(),
        ],
    )
    .map_err(|e| storage("Failed to insert message", e))?;
    Ok(())
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ColloquyError::Storage(format!("Invalid id '{}': {}", raw, e)))
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| ColloquyError::Storage(format!("Invalid timestamp: {}", micros)))
}

fn column<T: rusqlite::types::FromSql>(row: &Row<'_>, idx: usize) -> Result<T> {
    row.get(idx)
        .map_err(|e| storage(&format!("Failed to read column {}", idx), e))
}

fn row_to_document(row: &Row<'_>) -> Result<Document> {
    let id: String = column(row, 0)?;
    let metadata: String = column(row, 2)?;
    Ok(Document {
        id: parse_uuid(&id)?,
        url: column(row, 1)?,
        metadata_map: serde_json::from_str(&metadata)?,
        created_at: from_micros(column(row, 3)?)?,
        updated_at: from_micros(column(row, 4)?)?,
    })
}

fn row_to_conversation(row: &Row<'_>) -> Result<ConversationRecord> {
    let id: String = column(row, 0)?;
    Ok(ConversationRecord {
        id: parse_uuid(&id)?,
        created_at: from_micros(column(row, 1)?)?,
    })
}

fn row_to_message(row: &Row<'_>) -> Result<MessageRecord> {
    let id: String = column(row, 0)?;
    let conversation_id: String = column(row, 1)?;
    let role: String = column(row, 2)?;
    let status: String = column(row, 4)?;
    Ok(MessageRecord {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        role: role.parse()?,
        content: column(row, 3)?,
        status: status.parse()?,
        created_at: from_micros(column(row, 5)?)?,
    })
}

fn row_to_sub_process(row: &Row<'_>) -> Result<SubProcess> {
    let id: String = column(row, 0)?;
    let message_id: String = column(row, 1)?;
    let payload: String = column(row, 3)?;
    Ok(SubProcess {
        id: parse_uuid(&id)?,
        message_id: parse_uuid(&message_id)?,
        kind: column(row, 2)?,
        payload: serde_json::from_str(&payload)?,
        created_at: from_micros(column(row, 4)?)?,
    })
}
