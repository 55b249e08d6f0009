//! Chat session engine.
//!
//! [`ChatEngine::send_message`] validates the request, takes the
//! conversation's single-flight lease, persists the user message and then
//! hands back a [`ChatSession`] whose events are produced by a background
//! task driving the generator. The task owns the lease, so the conversation
//! is released however the session ends.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use colloquy_core::config::ChatConfig;
use colloquy_core::events::StreamEvent;
use colloquy_core::types::{Message, MessageStatus};
use colloquy_storage::{ConversationStore, MessageRecord};

use crate::aggregator::{into_message, run_blocking, ConversationAggregator};
use crate::error::ChatError;
use crate::generation::{GenerationRequest, GenerationStep, Generator, StepStream};
use crate::session::{PartialMessage, SessionState};
use crate::single_flight::{InFlightGuard, InFlightRegistry};

/// Drives send-message sessions against one generator.
#[derive(Clone)]
pub struct ChatEngine {
    aggregator: ConversationAggregator,
    conversations: Arc<dyn ConversationStore>,
    generator: Arc<dyn Generator>,
    in_flight: InFlightRegistry,
    config: ChatConfig,
}

/// One running send-message interaction.
///
/// Events arrive in generation order: zero or more deltas, at most one
/// failure, then exactly one `End`. Dropping the session cancels generation.
#[derive(Debug)]
pub struct ChatSession {
    pub conversation_id: Uuid,
    pub user_message: Message,
    pub assistant_message_id: Uuid,
    events: mpsc::Receiver<StreamEvent>,
}

impl ChatSession {
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<StreamEvent> {
        ReceiverStream::new(self.events)
    }

    /// Read every remaining event up to and including `End`.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }
}

enum Outcome {
    Completed,
    Failed(String),
    Disconnected,
}

impl ChatEngine {
    pub fn new(
        aggregator: ConversationAggregator,
        generator: Arc<dyn Generator>,
        config: ChatConfig,
    ) -> Self {
        Self {
            conversations: aggregator.conversation_store(),
            aggregator,
            generator,
            in_flight: InFlightRegistry::new(),
            config,
        }
    }

    pub fn aggregator(&self) -> &ConversationAggregator {
        &self.aggregator
    }

    /// Whether a session is currently running for the conversation.
    pub fn is_busy(&self, conversation_id: Uuid) -> bool {
        self.in_flight.is_active(conversation_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.in_flight.active_count()
    }

    /// Start a send-message session.
    ///
    /// Fails before anything is persisted when the text is empty or too
    /// long, the conversation is busy, or the conversation does not exist.
    /// Once this returns, the user message is durable.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        text: &str,
    ) -> Result<ChatSession, ChatError> {
        self.validate_text(text)?;

        let guard = self
            .in_flight
            .try_acquire(conversation_id)
            .ok_or(ChatError::Busy(conversation_id))?;
        let mut state = SessionState::Received;

        let conversation = self.aggregator.get_conversation(conversation_id).await?;

        let user_record = MessageRecord::user(conversation_id, text);
        let store = Arc::clone(&self.conversations);
        let to_insert = user_record.clone();
        run_blocking(move || store.insert_message(&to_insert)).await?;
        info!(
            conversation_id = %conversation_id,
            message_id = %user_record.id,
            "User message persisted"
        );

        let skip = conversation
            .messages
            .len()
            .saturating_sub(self.config.context_messages);
        let request = GenerationRequest {
            conversation_id,
            history: conversation.messages.into_iter().skip(skip).collect(),
            documents: conversation.documents,
            user_message: text.to_string(),
        };

        let partial = PartialMessage::new(conversation_id);
        let assistant_message_id = partial.id();
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));

        advance(&mut state, SessionState::Generating, conversation_id);
        let driver = SessionDriver {
            conversation_id,
            conversations: Arc::clone(&self.conversations),
            generator: Arc::clone(&self.generator),
            step_timeout: Duration::from_secs(self.config.step_timeout_secs),
            state,
            partial,
            tx,
            guard,
        };
        tokio::spawn(driver.run(request));

        Ok(ChatSession {
            conversation_id,
            user_message: into_message(user_record, Vec::new()),
            assistant_message_id,
            events: rx,
        })
    }

    fn validate_text(&self, text: &str) -> Result<(), ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::InvalidInput("message must not be empty".into()));
        }
        let length = text.chars().count();
        if length > self.config.max_message_length {
            return Err(ChatError::InvalidInput(format!(
                "message is {} characters, the maximum is {}",
                length, self.config.max_message_length
            )));
        }
        Ok(())
    }
}

fn advance(state: &mut SessionState, to: SessionState, conversation_id: Uuid) {
    match state.advance(to) {
        Ok(next) => {
            debug!(conversation_id = %conversation_id, from = ?state, to = ?next, "Session state");
            *state = next;
        }
        Err(e) => warn!(conversation_id = %conversation_id, error = %e, "Ignoring session transition"),
    }
}

/// Background half of a session. Owns the lease and the event sender.
struct SessionDriver {
    conversation_id: Uuid,
    conversations: Arc<dyn ConversationStore>,
    generator: Arc<dyn Generator>,
    step_timeout: Duration,
    state: SessionState,
    partial: PartialMessage,
    tx: mpsc::Sender<StreamEvent>,
    guard: InFlightGuard,
}

impl SessionDriver {
    async fn run(mut self, request: GenerationRequest) {
        let generate = AssertUnwindSafe(self.generator.generate(request)).catch_unwind();
        let started = tokio::time::timeout(self.step_timeout, generate).await;
        let outcome = match started {
            Ok(Ok(Ok(stream))) => self.pump(stream).await,
            Ok(Ok(Err(e))) => Outcome::Failed(e.to_string()),
            Ok(Err(panic)) => self.panicked(panic),
            Err(_) => Outcome::Failed(format!(
                "generation did not start within {}s",
                self.step_timeout.as_secs()
            )),
        };

        let mut events = Vec::new();
        match outcome {
            Outcome::Completed => {
                if self.partial.steps() == 0 {
                    let delta = self.partial.apply(GenerationStep::default());
                    if self.tx.send(StreamEvent::Delta(delta)).await.is_err() {
                        debug!(conversation_id = %self.conversation_id, "Caller gone before empty reply");
                    }
                }
                advance(&mut self.state, SessionState::Completed, self.conversation_id);
                if let Err(e) = self.persist(MessageStatus::Complete).await {
                    error!(
                        conversation_id = %self.conversation_id,
                        error = %e,
                        "Failed to persist assistant message"
                    );
                    events.push(StreamEvent::Failed {
                        message_id: None,
                        error: "failed to save the reply".to_string(),
                    });
                } else {
                    info!(
                        conversation_id = %self.conversation_id,
                        message_id = %self.partial.id(),
                        steps = self.partial.steps(),
                        "Assistant message completed"
                    );
                }
            }
            Outcome::Failed(reason) => {
                advance(&mut self.state, SessionState::Failed, self.conversation_id);
                warn!(
                    conversation_id = %self.conversation_id,
                    steps = self.partial.steps(),
                    error = %reason,
                    "Generation failed"
                );
                let message_id = if self.partial.steps() > 0 {
                    match self.persist(MessageStatus::Incomplete).await {
                        Ok(()) => Some(self.partial.id()),
                        Err(e) => {
                            error!(
                                conversation_id = %self.conversation_id,
                                error = %e,
                                "Failed to persist partial assistant message"
                            );
                            None
                        }
                    }
                } else {
                    None
                };
                events.push(StreamEvent::Failed {
                    message_id,
                    error: reason,
                });
            }
            Outcome::Disconnected => {
                advance(&mut self.state, SessionState::Failed, self.conversation_id);
                info!(
                    conversation_id = %self.conversation_id,
                    steps = self.partial.steps(),
                    "Caller disconnected, generation cancelled"
                );
                if self.partial.steps() > 0 {
                    if let Err(e) = self.persist(MessageStatus::Incomplete).await {
                        error!(
                            conversation_id = %self.conversation_id,
                            error = %e,
                            "Failed to persist partial assistant message"
                        );
                    }
                }
                return;
            }
        }

        // Release before the terminator so a caller that saw `End` can send again.
        let SessionDriver { tx, guard, .. } = self;
        drop(guard);
        events.push(StreamEvent::End);
        for event in events {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    }

    /// Forward generation steps as deltas until the generator finishes, fails
    /// or the caller goes away.
    async fn pump(&mut self, mut stream: StepStream) -> Outcome {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.tx.closed() => return Outcome::Disconnected,
                next = tokio::time::timeout(
                    self.step_timeout,
                    AssertUnwindSafe(stream.next()).catch_unwind(),
                ) => next,
            };

            let step = match next {
                Ok(Err(panic)) => return self.panicked(panic),
                Err(_) => {
                    return Outcome::Failed(format!(
                        "no generation progress within {}s",
                        self.step_timeout.as_secs()
                    ))
                }
                Ok(Ok(None)) => return Outcome::Completed,
                Ok(Ok(Some(Err(e)))) => return Outcome::Failed(e.to_string()),
                Ok(Ok(Some(Ok(step)))) => step,
            };

            if self.state == SessionState::Generating {
                advance(&mut self.state, SessionState::Streaming, self.conversation_id);
            }
            let delta = self.partial.apply(step);
            if self.tx.send(StreamEvent::Delta(delta)).await.is_err() {
                return Outcome::Disconnected;
            }
        }
    }

    /// A panicking generator fails the session like any other generator error.
    fn panicked(&self, panic: Box<dyn Any + Send>) -> Outcome {
        let detail = panic_message(panic.as_ref());
        error!(
            conversation_id = %self.conversation_id,
            steps = self.partial.steps(),
            panic = %detail,
            "Generator panicked"
        );
        Outcome::Failed(format!("generation panicked: {}", detail))
    }

    async fn persist(&self, status: MessageStatus) -> Result<(), ChatError> {
        let (record, sub_processes) = self.partial.clone().into_record(status);
        let store = Arc::clone(&self.conversations);
        run_blocking(move || store.insert_message_with_sub_processes(&record, &sub_processes)).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use colloquy_core::types::{MessageRole, NewSubProcess};
    use colloquy_storage::{
        ConversationRepository, Database, DocumentRepository, DocumentStore,
    };
    use serde_json::json;

    use crate::error::GenerationError;
    use crate::generation::{ExtractiveGenerator, ScriptedGenerator};

    /// Yields `chunk` and then panics, or panics before streaming at all.
    struct PanickingGenerator {
        chunk: Option<&'static str>,
    }

    #[async_trait]
    impl Generator for PanickingGenerator {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<StepStream, GenerationError> {
            let Some(chunk) = self.chunk else {
                panic!("model weights missing");
            };
            let steps = tokio_stream::iter(vec![Some(chunk), None]).map(|chunk| match chunk {
                Some(text) => Ok::<_, GenerationError>(GenerationStep::append(text)),
                None => panic!("tokenizer overflow"),
            });
            Ok(Box::pin(steps))
        }
    }

    struct Fixture {
        engine: ChatEngine,
        documents: Arc<DocumentRepository>,
    }

    fn fixture(generator: Arc<dyn Generator>) -> Fixture {
        fixture_with_config(generator, ChatConfig::default())
    }

    fn fixture_with_config(generator: Arc<dyn Generator>, config: ChatConfig) -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let conversations = Arc::new(ConversationRepository::new(Arc::clone(&db)));
        let documents = Arc::new(DocumentRepository::new(db));
        let aggregator = ConversationAggregator::new(conversations, documents.clone());
        Fixture {
            engine: ChatEngine::new(aggregator, generator, config),
            documents,
        }
    }

    fn last_delta_content(events: &[StreamEvent]) -> Option<String> {
        events.iter().rev().find_map(|e| match e {
            StreamEvent::Delta(delta) => Some(delta.content().to_string()),
            _ => None,
        })
    }

    async fn wait_until_idle(engine: &ChatEngine, conversation_id: Uuid) {
        for _ in 0..200 {
            if !engine.is_busy(conversation_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session for {} never finished", conversation_id);
    }

    #[tokio::test]
    async fn test_example_scenario() {
        let f = fixture(Arc::new(ExtractiveGenerator::new()));
        let d1 = f
            .documents
            .upsert_document_by_url("https://example.com/d1.pdf", serde_json::Map::new())
            .unwrap();
        let d2 = f
            .documents
            .upsert_document_by_url("https://example.com/d2.pdf", serde_json::Map::new())
            .unwrap();

        let created = f
            .engine
            .aggregator()
            .create_conversation(&[d1.id, d2.id])
            .await
            .unwrap();
        assert_eq!(created.messages.len(), 0);
        assert_eq!(created.documents.len(), 2);

        let session = f.engine.send_message(created.id, "hello").await.unwrap();
        let events = session.collect().await;
        assert!(events.len() >= 2);
        assert!(events.last().unwrap().is_terminal());
        let last = last_delta_content(&events).unwrap();
        assert!(!last.is_empty());

        let fetched = f.engine.aggregator().get_conversation(created.id).await.unwrap();
        assert_eq!(fetched.messages.len(), 2);
        assert_eq!(fetched.messages[0].role, MessageRole::User);
        assert_eq!(fetched.messages[0].content, "hello");
        assert_eq!(fetched.messages[1].role, MessageRole::Assistant);
        assert_eq!(fetched.messages[1].content, last);
        assert_eq!(fetched.messages[1].status, MessageStatus::Complete);
        assert_eq!(fetched.messages[1].sub_processes[0].kind, "retrieval");
        assert_eq!(fetched.documents, created.documents);
    }

    #[tokio::test]
    async fn test_deltas_are_ordered_and_cumulative() {
        let f = fixture(Arc::new(ScriptedGenerator::from_chunks(&["a", "b", "c"])));
        let convo = f.engine.aggregator().create_conversation(&[]).await.unwrap();

        let events = f.engine.send_message(convo.id, "go").await.unwrap().collect().await;
        let contents: Vec<(u32, String)> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Delta(d) => Some((d.step, d.content().to_string())),
                _ => None,
            })
            .collect();
        assert_eq!(
            contents,
            vec![(0, "a".to_string()), (1, "ab".to_string()), (2, "abc".to_string())]
        );
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn test_zero_step_generation_emits_empty_delta() {
        let f = fixture(Arc::new(ScriptedGenerator::new(vec![])));
        let convo = f.engine.aggregator().create_conversation(&[]).await.unwrap();

        let events = f.engine.send_message(convo.id, "anyone?").await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(last_delta_content(&events).as_deref(), Some(""));

        let fetched = f.engine.aggregator().get_conversation(convo.id).await.unwrap();
        assert_eq!(fetched.messages[1].content, "");
        assert_eq!(fetched.messages[1].status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn test_failure_mid_stream_persists_incomplete() {
        let steps = vec![
            GenerationStep::sub_process(NewSubProcess::new("retrieval", json!({"hits": 1}))),
            GenerationStep::append("partial"),
            GenerationStep::append(" never sent"),
        ];
        let f = fixture(Arc::new(ScriptedGenerator::new(steps).fail_at(2, "model crashed")));
        let convo = f.engine.aggregator().create_conversation(&[]).await.unwrap();

        let session = f.engine.send_message(convo.id, "question").await.unwrap();
        let assistant_id = session.assistant_message_id;
        let events = session.collect().await;

        assert!(matches!(
            &events[events.len() - 2],
            StreamEvent::Failed { message_id: Some(id), error } if *id == assistant_id && error == "model crashed"
        ));
        assert_eq!(events.last(), Some(&StreamEvent::End));

        let message = f
            .engine
            .aggregator()
            .get_message(convo.id, assistant_id)
            .await
            .unwrap();
        assert_eq!(message.status, MessageStatus::Incomplete);
        assert_eq!(message.content, "partial");
        assert_eq!(message.sub_processes.len(), 1);
        assert_eq!(message.sub_processes[0].payload, json!({"hits": 1}));
    }

    #[tokio::test]
    async fn test_failure_before_output_creates_no_assistant_message() {
        let f = fixture(Arc::new(ScriptedGenerator::from_chunks(&["x"]).fail_at(0, "offline")));
        let convo = f.engine.aggregator().create_conversation(&[]).await.unwrap();

        let events = f.engine.send_message(convo.id, "hi").await.unwrap().collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Failed {
                    message_id: None,
                    error: "offline".to_string()
                },
                StreamEvent::End
            ]
        );

        let fetched = f.engine.aggregator().get_conversation(convo.id).await.unwrap();
        assert_eq!(fetched.messages.len(), 1);
        assert_eq!(fetched.messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_concurrent_send_is_busy() {
        let generator = ScriptedGenerator::from_chunks(&["slow", " reply"])
            .with_delay(Duration::from_millis(50));
        let f = fixture(Arc::new(generator));
        let convo = f.engine.aggregator().create_conversation(&[]).await.unwrap();

        let first = f.engine.send_message(convo.id, "one").await.unwrap();
        let second = f.engine.send_message(convo.id, "two").await;
        assert!(matches!(second, Err(ChatError::Busy(id)) if id == convo.id));

        first.collect().await;
        let fetched = f.engine.aggregator().get_conversation(convo.id).await.unwrap();
        assert_eq!(fetched.messages.len(), 2);
        assert_eq!(fetched.messages[0].content, "one");

        // The lease is released before End is delivered.
        assert!(!f.engine.is_busy(convo.id));
        let again = f.engine.send_message(convo.id, "three").await.unwrap();
        again.collect().await;
    }

    #[tokio::test]
    async fn test_other_conversations_unaffected_by_busy() {
        let generator =
            ScriptedGenerator::from_chunks(&["a", "b"]).with_delay(Duration::from_millis(30));
        let f = fixture(Arc::new(generator));
        let a = f.engine.aggregator().create_conversation(&[]).await.unwrap();
        let b = f.engine.aggregator().create_conversation(&[]).await.unwrap();

        let first = f.engine.send_message(a.id, "x").await.unwrap();
        let second = f.engine.send_message(b.id, "y").await.unwrap();
        assert_eq!(f.engine.active_sessions(), 2);
        first.collect().await;
        second.collect().await;
    }

    #[tokio::test]
    async fn test_disconnect_stops_generation_and_keeps_partial() {
        let generator = Arc::new(
            ScriptedGenerator::from_chunks(&["word "; 100]).with_delay(Duration::from_millis(10)),
        );
        let f = fixture(generator.clone());
        let convo = f.engine.aggregator().create_conversation(&[]).await.unwrap();

        let mut session = f.engine.send_message(convo.id, "long answer please").await.unwrap();
        let assistant_id = session.assistant_message_id;
        assert!(matches!(session.next_event().await, Some(StreamEvent::Delta(_))));
        drop(session);

        wait_until_idle(&f.engine, convo.id).await;
        let pulled = generator.pulled();
        assert!(pulled < 100);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(generator.pulled() <= pulled + 1);

        let message = f
            .engine
            .aggregator()
            .get_message(convo.id, assistant_id)
            .await
            .unwrap();
        assert_eq!(message.status, MessageStatus::Incomplete);
        assert!(message.content.starts_with("word"));
    }

    #[tokio::test]
    async fn test_step_timeout_fails_session() {
        let generator =
            ScriptedGenerator::from_chunks(&["late"]).with_delay(Duration::from_secs(3));
        let config = ChatConfig {
            step_timeout_secs: 1,
            ..ChatConfig::default()
        };
        let f = fixture_with_config(Arc::new(generator), config);
        let convo = f.engine.aggregator().create_conversation(&[]).await.unwrap();

        let events = f.engine.send_message(convo.id, "hurry").await.unwrap().collect().await;
        assert!(matches!(&events[0], StreamEvent::Failed { message_id: None, .. }));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_conversation_persists_nothing() {
        let f = fixture(Arc::new(ExtractiveGenerator::new()));
        let id = Uuid::new_v4();
        let err = f.engine.send_message(id, "hello").await.unwrap_err();
        assert!(matches!(err, ChatError::ConversationNotFound(missing) if missing == id));
        assert!(!f.engine.is_busy(id));
    }

    #[tokio::test]
    async fn test_invalid_text_rejected_before_persistence() {
        let config = ChatConfig {
            max_message_length: 5,
            ..ChatConfig::default()
        };
        let f = fixture_with_config(Arc::new(ExtractiveGenerator::new()), config);
        let convo = f.engine.aggregator().create_conversation(&[]).await.unwrap();

        for text in ["", "   ", "too long"] {
            let err = f.engine.send_message(convo.id, text).await.unwrap_err();
            assert!(matches!(err, ChatError::InvalidInput(_)), "{:?}", text);
        }
        // Length counts characters, not bytes.
        f.engine.send_message(convo.id, "héllo").await.unwrap().collect().await;

        let fetched = f.engine.aggregator().get_conversation(convo.id).await.unwrap();
        assert_eq!(fetched.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let config = ChatConfig {
            context_messages: 2,
            ..ChatConfig::default()
        };
        let f = fixture_with_config(Arc::new(ExtractiveGenerator::new()), config);
        let convo = f.engine.aggregator().create_conversation(&[]).await.unwrap();

        for text in ["one", "two", "three"] {
            f.engine.send_message(convo.id, text).await.unwrap().collect().await;
        }
        let fetched = f.engine.aggregator().get_conversation(convo.id).await.unwrap();
        assert_eq!(fetched.messages.len(), 6);
        // Two prior messages make one earlier exchange.
        assert!(fetched.messages[5].content.ends_with("1 earlier exchange."));
    }

    #[tokio::test]
    async fn test_panic_mid_stream_fails_session_and_keeps_partial() {
        let f = fixture(Arc::new(PanickingGenerator { chunk: Some("par") }));
        let convo = f.engine.aggregator().create_conversation(&[]).await.unwrap();

        let session = f.engine.send_message(convo.id, "question").await.unwrap();
        let assistant_id = session.assistant_message_id;
        let events = session.collect().await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::Delta(d) if d.content() == "par"));
        assert!(matches!(
            &events[1],
            StreamEvent::Failed { message_id: Some(id), error }
                if *id == assistant_id && error.contains("tokenizer overflow")
        ));
        assert_eq!(events.last(), Some(&StreamEvent::End));
        assert!(!f.engine.is_busy(convo.id));

        let message = f
            .engine
            .aggregator()
            .get_message(convo.id, assistant_id)
            .await
            .unwrap();
        assert_eq!(message.status, MessageStatus::Incomplete);
        assert_eq!(message.content, "par");
    }

    #[tokio::test]
    async fn test_panic_before_stream_fails_session() {
        let f = fixture(Arc::new(PanickingGenerator { chunk: None }));
        let convo = f.engine.aggregator().create_conversation(&[]).await.unwrap();

        let events = f.engine.send_message(convo.id, "hi").await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            StreamEvent::Failed { message_id: None, error } if error.contains("model weights missing")
        ));
        assert_eq!(events[1], StreamEvent::End);
        assert!(!f.engine.is_busy(convo.id));

        let fetched = f.engine.aggregator().get_conversation(convo.id).await.unwrap();
        assert_eq!(fetched.messages.len(), 1);
    }
}
