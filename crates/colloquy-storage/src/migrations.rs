//! Database schema migrations.
//!
//! Applies the initial schema: documents, conversations, messages,
//! sub_processes, the conversation_documents link table, and the
//! schema_migrations bookkeeping table.

use rusqlite::Connection;
use tracing::info;

use colloquy_core::error::ColloquyError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), ColloquyError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| ColloquyError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| ColloquyError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
///
/// Timestamps are microseconds since the epoch. Messages and sub-processes
/// are read back in rowid order, which is insertion order. Child rows cascade on
/// conversation deletion so no orphan can survive it.
fn apply_v1(conn: &Connection) -> Result<(), ColloquyError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS documents (
            id              TEXT PRIMARY KEY NOT NULL,
            url             TEXT UNIQUE,
            metadata_map    TEXT NOT NULL DEFAULT '{}',
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY NOT NULL,
            created_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversation_documents (
            conversation_id TEXT NOT NULL,
            document_id     TEXT NOT NULL,
            PRIMARY KEY (conversation_id, document_id),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_conversation_documents_document
            ON conversation_documents (document_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY NOT NULL,
            conversation_id TEXT NOT NULL,
            role            TEXT NOT NULL
                            CHECK (role IN ('user', 'assistant')),
            content         TEXT NOT NULL DEFAULT '',
            status          TEXT NOT NULL DEFAULT 'complete'
                            CHECK (status IN ('pending', 'complete', 'incomplete')),
            created_at      INTEGER NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages (conversation_id);

        CREATE TABLE IF NOT EXISTS sub_processes (
            id              TEXT PRIMARY KEY NOT NULL,
            message_id      TEXT NOT NULL,
            kind            TEXT NOT NULL,
            payload         TEXT NOT NULL DEFAULT 'null',
            created_at      INTEGER NOT NULL,
            FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_sub_processes_message
            ON sub_processes (message_id);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| ColloquyError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}
