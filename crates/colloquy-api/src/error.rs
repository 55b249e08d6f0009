//! API error types and JSON error response formatting.
//!
//! ApiError provides a consistent JSON error response format across all
//! endpoints. Internal failures are logged in full and reported to the
//! caller with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use colloquy_chat::ChatError;
use colloquy_core::error::ColloquyError;

const INTERNAL_MESSAGE: &str = "internal server error";

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured details about the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request - missing or invalid parameters.
    BadRequest(String),
    /// 404 Not Found - resource does not exist.
    NotFound(String),
    /// 409 Conflict - a message is already in progress for the conversation.
    Conflict(String),
    /// 500 Internal Server Error - the message is never shown to callers.
    Internal(String),
}

impl ApiError {
    fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        tracing::error!(error = %err, "{}", context);
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                INTERNAL_MESSAGE.to_string(),
            ),
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
            details: None,
        };

        (status, Json(body)).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::ConversationNotFound(_) | ChatError::MessageNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            ChatError::InvalidInput(msg) => ApiError::BadRequest(msg),
            ChatError::Busy(_) => ApiError::Conflict(err.to_string()),
            ChatError::Generation(_) | ChatError::Storage(_) | ChatError::Internal(_) => {
                ApiError::internal("Request failed", err)
            }
        }
    }
}

impl From<ColloquyError> for ApiError {
    fn from(err: ColloquyError) -> Self {
        match err {
            ColloquyError::InvalidInput(msg) => ApiError::BadRequest(msg),
            other => ApiError::internal("Request failed", other),
        }
    }
}
