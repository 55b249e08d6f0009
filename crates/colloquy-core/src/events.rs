use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Message, SubProcess};

/// One data event of a send-message session.
///
/// `message` is the current best view of the assistant message: cumulative
/// content and every sub-process recorded so far. `sub_processes` holds only
/// the sub-processes produced at this step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageDelta {
    /// Zero-based index of the generation step.
    pub step: u32,
    pub message: Message,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_processes: Vec<SubProcess>,
}

impl MessageDelta {
    pub fn content(&self) -> &str {
        &self.message.content
    }
}

/// Events emitted by the chat engine for a single send-message session.
///
/// The sequence is zero or more `Delta` events, optionally one `Failed`
/// event, then exactly one `End`. Nothing follows `End`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Delta(MessageDelta),
    /// Generation failed. `message_id` is set when a partial assistant
    /// message was persisted as incomplete.
    Failed {
        message_id: Option<Uuid>,
        error: String,
    },
    End,
}

impl StreamEvent {
    /// Name used for the event on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Delta(_) => "message",
            StreamEvent::Failed { .. } => "error",
            StreamEvent::End => "end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End)
    }
}
