//! Route handler functions for all API endpoints.
//!
//! Each handler extracts path/query/body parameters via axum extractors,
//! calls the aggregator, engine or document store, and returns JSON. The
//! send-message handler answers with a Server-Sent Events stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum_extra::extract::Query as MultiQuery;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use uuid::Uuid;

use colloquy_core::events::StreamEvent;
use colloquy_core::types::{Conversation, ConversationCreate, Document, DocumentQuery, Message};
use colloquy_storage::{ConversationStore, DocumentStore};

use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Request and query types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SendMessageParams {
    pub user_message: String,
}

/// `document_ids` may repeat, and each value may hold comma separated ids.
#[derive(Debug, Deserialize)]
pub struct DocumentListParams {
    #[serde(default)]
    pub document_ids: Vec<String>,
}

/// Request body for POST /api/document/ingest-pdf.
#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentIngestion {
    pub url: String,
    pub name: String,
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub documents: u64,
    pub conversations: u64,
    pub active_sessions: usize,
}

/// Run a synchronous store call without stalling the runtime.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> colloquy_core::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Blocking task failed");
            ApiError::Internal(e.to_string())
        })?
        .map_err(ApiError::from)
}

fn parse_document_ids<'a>(
    values: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<Uuid>, ApiError> {
    values
        .into_iter()
        .flat_map(|raw| raw.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Uuid::parse_str(s)
                .map_err(|_| ApiError::BadRequest(format!("Invalid document id: '{}'", s)))
        })
        .collect()
}

// =============================================================================
// Health
// =============================================================================

/// GET /health - health check with store counts.
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let documents = Arc::clone(&state.documents);
    let conversations = Arc::clone(&state.conversations);
    let (documents, conversations) = blocking(move || {
        Ok((
            documents.count_documents()?,
            conversations.count_conversations()?,
        ))
    })
    .await?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        documents,
        conversations,
        active_sessions: state.engine.active_sessions(),
    }))
}

// =============================================================================
// Conversations
// =============================================================================

/// POST /api/conversation/ - create a conversation linked to documents.
pub async fn create_conversation(
    State(state): State<AppState>,
    Json(body): Json<ConversationCreate>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state
        .aggregator()
        .create_conversation(&body.document_ids)
        .await?;
    Ok(Json(conversation))
}

/// GET /api/conversation/{conversation_id} - the full conversation aggregate.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state.aggregator().get_conversation(conversation_id).await?;
    Ok(Json(conversation))
}

/// DELETE /api/conversation/{conversation_id}
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.aggregator().delete_conversation(conversation_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!(
            "conversation not found: {}",
            conversation_id
        )))
    }
}

/// GET /api/conversation/{conversation_id}/message/{message_id}
pub async fn get_message(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Message>, ApiError> {
    let message = state
        .aggregator()
        .get_message(conversation_id, message_id)
        .await?;
    Ok(Json(message))
}

fn to_sse_event(event: &StreamEvent) -> Event {
    match Event::default().event(event.name()).json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode stream event");
            Event::default().event("error").data("event encoding failed")
        }
    }
}

/// GET /api/conversation/{conversation_id}/message?user_message=...
///
/// Streams `message` events with the cumulative assistant message, an
/// optional `error` event, and a final `end` event. Busy, missing and
/// invalid requests fail with a JSON error before the stream opens.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(params): Query<SendMessageParams>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>> + Send>, ApiError> {
    let session = state
        .engine
        .send_message(conversation_id, &params.user_message)
        .await?;
    tracing::debug!(
        conversation_id = %conversation_id,
        message_id = %session.assistant_message_id,
        "Streaming assistant message"
    );

    let stream = session
        .into_stream()
        .map(|event| Ok::<_, Infallible>(to_sse_event(&event)));
    let keep_alive = Duration::from_secs(state.config.api.keep_alive_secs);

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive)))
}

// =============================================================================
// Documents
// =============================================================================

/// GET /api/document/ - all documents, or those named by `document_ids`.
pub async fn list_documents(
    State(state): State<AppState>,
    MultiQuery(params): MultiQuery<DocumentListParams>,
) -> Result<Json<Vec<Document>>, ApiError> {
    let query = if params.document_ids.is_empty() {
        DocumentQuery::all()
    } else {
        let values = params.document_ids.iter().map(String::as_str);
        DocumentQuery::by_ids(parse_document_ids(values)?)
    };

    let store = Arc::clone(&state.documents);
    let documents = blocking(move || store.fetch_documents(&query)).await?;
    if documents.is_empty() {
        return Err(ApiError::NotFound("Document(s) not found".to_string()));
    }
    Ok(Json(documents))
}

/// GET /api/document/{document_id}
pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<Document>, ApiError> {
    let store = Arc::clone(&state.documents);
    let documents =
        blocking(move || store.fetch_documents(&DocumentQuery::by_id(document_id))).await?;
    documents
        .into_iter()
        .next()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Document not found".to_string()))
}

/// POST /api/document/ingest-pdf - register a document by url and name.
pub async fn ingest_pdf(
    State(state): State<AppState>,
    Json(body): Json<DocumentIngestion>,
) -> Result<Json<Document>, ApiError> {
    if !body.url.starts_with("http") {
        return Err(ApiError::BadRequest(
            "URL must be an HTTP-based URL".to_string(),
        ));
    }

    let mut metadata_map = serde_json::Map::new();
    metadata_map.insert("name".to_string(), serde_json::Value::String(body.name));

    let store = Arc::clone(&state.documents);
    let url = body.url;
    let document = blocking(move || store.upsert_document_by_url(&url, metadata_map)).await?;
    tracing::info!(document_id = %document.id, url = ?document.url, "Document ingested");
    Ok(Json(document))
}
