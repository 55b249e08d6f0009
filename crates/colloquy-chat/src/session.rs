//! Send-message session lifecycle.
//!
//! Allowed transitions:
//! Received -> Generating -> Streaming -> Completed
//! Generating -> Failed, Streaming -> Failed

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use colloquy_core::events::MessageDelta;
use colloquy_core::types::{
    timestamp_now, Message, MessageRole, MessageStatus, SubProcess,
};
use colloquy_storage::MessageRecord;

use crate::error::ChatError;
use crate::generation::{ContentUpdate, GenerationStep};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Received,
    Generating,
    Streaming,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    /// Move to `to` if the transition is allowed.
    pub fn advance(self, to: SessionState) -> Result<SessionState, ChatError> {
        validate_transition(self, to)?;
        Ok(to)
    }
}

/// Validate that a session state transition is allowed.
///
/// A generation with no steps completes straight from `Generating`.
pub fn validate_transition(from: SessionState, to: SessionState) -> Result<(), ChatError> {
    let valid = matches!(
        (from, to),
        (SessionState::Received, SessionState::Generating)
            | (SessionState::Generating, SessionState::Streaming)
            | (SessionState::Generating, SessionState::Completed)
            | (SessionState::Generating, SessionState::Failed)
            | (SessionState::Streaming, SessionState::Completed)
            | (SessionState::Streaming, SessionState::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(ChatError::Internal(format!(
            "invalid session transition {:?} -> {:?}",
            from, to
        )))
    }
}

/// The assistant message as accumulated so far.
///
/// Each applied step produces a [`MessageDelta`] whose message is the
/// cumulative view, so the latest delta always matches what would be
/// persisted at that point.
#[derive(Debug, Clone)]
pub struct PartialMessage {
    id: Uuid,
    conversation_id: Uuid,
    content: String,
    sub_processes: Vec<SubProcess>,
    steps: u32,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl PartialMessage {
    pub fn new(conversation_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            content: String::new(),
            sub_processes: Vec::new(),
            steps: 0,
            created_at: timestamp_now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Fold one generation step in and return the event describing it.
    pub fn apply(&mut self, step: GenerationStep) -> MessageDelta {
        match step.content {
            Some(ContentUpdate::Append(text)) => self.content.push_str(&text),
            Some(ContentUpdate::Replace(text)) => self.content = text,
            None => {}
        }

        let new_sub_processes: Vec<SubProcess> = step
            .sub_processes
            .into_iter()
            .map(|sp| SubProcess {
                id: Uuid::new_v4(),
                message_id: self.id,
                kind: sp.kind,
                payload: sp.payload,
                created_at: timestamp_now(),
            })
            .collect();
        self.sub_processes.extend(new_sub_processes.iter().cloned());

        let delta = MessageDelta {
            step: self.steps,
            message: self.snapshot(MessageStatus::Pending),
            sub_processes: new_sub_processes,
        };
        self.steps += 1;
        delta
    }

    pub fn snapshot(&self, status: MessageStatus) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            role: MessageRole::Assistant,
            content: self.content.clone(),
            status,
            sub_processes: self.sub_processes.clone(),
            created_at: self.created_at,
        }
    }

    /// Row shape for persisting the message with the given final status.
    pub fn into_record(self, status: MessageStatus) -> (MessageRecord, Vec<SubProcess>) {
        let record = MessageRecord {
            id: self.id,
            conversation_id: self.conversation_id,
            role: MessageRole::Assistant,
            content: self.content,
            status,
            created_at: self.created_at,
        };
        (record, self.sub_processes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::types::NewSubProcess;
    use serde_json::json;

    // =====================================================================
    // Transitions
    // =====================================================================

    #[test]
    fn test_happy_path() {
        let state = SessionState::Received
            .advance(SessionState::Generating)
            .and_then(|s| s.advance(SessionState::Streaming))
            .and_then(|s| s.advance(SessionState::Completed))
            .unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn test_failure_reachable_from_generating_and_streaming() {
        assert!(validate_transition(SessionState::Generating, SessionState::Failed).is_ok());
        assert!(validate_transition(SessionState::Streaming, SessionState::Failed).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(validate_transition(SessionState::Received, SessionState::Streaming).is_err());
        assert!(validate_transition(SessionState::Received, SessionState::Failed).is_err());
        assert!(validate_transition(SessionState::Completed, SessionState::Streaming).is_err());
        assert!(validate_transition(SessionState::Failed, SessionState::Completed).is_err());
        assert!(validate_transition(SessionState::Streaming, SessionState::Generating).is_err());
    }

    // =====================================================================
    // Accumulation
    // =====================================================================

    #[test]
    fn test_deltas_are_cumulative() {
        let mut partial = PartialMessage::new(Uuid::new_v4());

        let first = partial.apply(GenerationStep::sub_process(NewSubProcess::new(
            "retrieval",
            json!({"documents": 2}),
        )));
        assert_eq!(first.step, 0);
        assert_eq!(first.content(), "");
        assert_eq!(first.sub_processes.len(), 1);

        let second = partial.apply(GenerationStep::append("Hello"));
        let third = partial.apply(GenerationStep::append(", world"));
        assert_eq!(second.step, 1);
        assert!(second.sub_processes.is_empty());
        assert_eq!(third.content(), "Hello, world");
        assert_eq!(third.message.sub_processes.len(), 1);
        assert_eq!(third.message.status, MessageStatus::Pending);
        assert_eq!(partial.steps(), 3);
    }

    #[test]
    fn test_replace_overwrites_content() {
        let mut partial = PartialMessage::new(Uuid::new_v4());
        partial.apply(GenerationStep::append("draft"));
        let delta = partial.apply(GenerationStep::replace("final"));
        assert_eq!(delta.content(), "final");
    }

    #[test]
    fn test_record_matches_last_delta() {
        let conversation_id = Uuid::new_v4();
        let mut partial = PartialMessage::new(conversation_id);
        partial.apply(GenerationStep::sub_process(NewSubProcess::new("retrieval", json!([]))));
        let last = partial.apply(GenerationStep::append("done"));

        let (record, sub_processes) = partial.into_record(MessageStatus::Incomplete);
        assert_eq!(record.id, last.message.id);
        assert_eq!(record.conversation_id, conversation_id);
        assert_eq!(record.content, last.content());
        assert_eq!(record.status, MessageStatus::Incomplete);
        assert_eq!(sub_processes, last.message.sub_processes);
        assert!(sub_processes.iter().all(|sp| sp.message_id == record.id));
    }
}
