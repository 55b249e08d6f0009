//! Error types for conversations and chat sessions.

use colloquy_core::error::ColloquyError;
use uuid::Uuid;

/// Caller-facing failure kinds.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(Uuid),
    #[error("message not found: {0}")]
    MessageNotFound(Uuid),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("conversation {0} already has a message in progress")]
    Busy(Uuid),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Whether the error is unexpected and must not be shown verbatim.
    pub fn is_internal(&self) -> bool {
        matches!(self, ChatError::Storage(_) | ChatError::Internal(_))
    }
}

impl From<ColloquyError> for ChatError {
    fn from(err: ColloquyError) -> Self {
        match err {
            ColloquyError::InvalidInput(msg) => ChatError::InvalidInput(msg),
            ColloquyError::Config(msg) => ChatError::Internal(msg),
            other => ChatError::Storage(other.to_string()),
        }
    }
}

impl From<GenerationError> for ChatError {
    fn from(err: GenerationError) -> Self {
        ChatError::Generation(err.0)
    }
}

/// Failure reported by a generation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct GenerationError(pub String);

impl GenerationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
