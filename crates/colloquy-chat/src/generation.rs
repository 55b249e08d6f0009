//! Generation collaborators.
//!
//! A [`Generator`] turns a user message plus conversation context into an
//! ordered stream of [`GenerationStep`]s. The engine never looks inside a
//! generator; it only folds the steps into the assistant message.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use uuid::Uuid;

use colloquy_core::types::{Document, Message, NewSubProcess};

use crate::error::GenerationError;

/// How a step changes the message content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentUpdate {
    Append(String),
    Replace(String),
}

/// One unit of generation progress.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerationStep {
    pub content: Option<ContentUpdate>,
    pub sub_processes: Vec<NewSubProcess>,
}

impl GenerationStep {
    pub fn append(text: impl Into<String>) -> Self {
        Self {
            content: Some(ContentUpdate::Append(text.into())),
            sub_processes: Vec::new(),
        }
    }

    pub fn replace(text: impl Into<String>) -> Self {
        Self {
            content: Some(ContentUpdate::Replace(text.into())),
            sub_processes: Vec::new(),
        }
    }

    pub fn sub_process(sub_process: NewSubProcess) -> Self {
        Self {
            content: None,
            sub_processes: vec![sub_process],
        }
    }

    pub fn with_sub_process(mut self, sub_process: NewSubProcess) -> Self {
        self.sub_processes.push(sub_process);
        self
    }
}

/// Everything a generator gets to see for one send-message call.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub conversation_id: Uuid,
    /// Prior messages, oldest first, bounded by the configured context window.
    pub history: Vec<Message>,
    pub documents: Vec<Document>,
    pub user_message: String,
}

pub type StepStream = Pin<Box<dyn Stream<Item = Result<GenerationStep, GenerationError>> + Send>>;

/// Produces the assistant reply for a send-message call.
///
/// Dropping the returned stream must stop any further work.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<StepStream, GenerationError>;
}

// =============================================================================
// ExtractiveGenerator
// =============================================================================

/// Deterministic generator that answers from the linked documents' metadata.
///
/// Emits a `retrieval` sub-process listing the documents consulted, then the
/// answer one word per step.
#[derive(Clone, Debug, Default)]
pub struct ExtractiveGenerator;

impl ExtractiveGenerator {
    pub fn new() -> Self {
        Self
    }

    fn compose_answer(request: &GenerationRequest) -> String {
        let question = request.user_message.trim();
        let mut answer = if request.documents.is_empty() {
            format!(
                "No documents are linked to this conversation, so there is nothing to cite for \"{}\".",
                question
            )
        } else {
            let names: Vec<String> =
                request.documents.iter().map(Document::display_name).collect();
            let scope = if names.len() == 1 {
                "1 document".to_string()
            } else {
                format!("{} documents", names.len())
            };
            format!(
                "Looking at {} for \"{}\": the relevant passages come from {}.",
                scope,
                question,
                names.join(", ")
            )
        };

        let earlier_turns = request.history.len() / 2;
        if earlier_turns > 0 {
            answer.push_str(&format!(
                " This follows {} earlier exchange{}.",
                earlier_turns,
                if earlier_turns == 1 { "" } else { "s" }
            ));
        }
        answer
    }
}

#[async_trait]
impl Generator for ExtractiveGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<StepStream, GenerationError> {
        let documents: Vec<serde_json::Value> = request
            .documents
            .iter()
            .map(|d| json!({ "id": d.id, "name": d.display_name(), "url": d.url }))
            .collect();
        let retrieval = NewSubProcess::new(
            "retrieval",
            json!({ "query": request.user_message, "documents": documents }),
        );

        let answer = Self::compose_answer(&request);
        let mut steps = vec![Ok(GenerationStep::sub_process(retrieval))];
        for (i, word) in answer.split(' ').enumerate() {
            let chunk = if i == 0 {
                word.to_string()
            } else {
                format!(" {}", word)
            };
            steps.push(Ok(GenerationStep::append(chunk)));
        }

        Ok(Box::pin(tokio_stream::iter(steps)))
    }
}

// =============================================================================
// ScriptedGenerator
// =============================================================================

/// Replays a fixed list of steps, optionally failing or pausing between them.
#[derive(Clone, Debug, Default)]
pub struct ScriptedGenerator {
    steps: Vec<GenerationStep>,
    fail_at: Option<(usize, String)>,
    delay: Option<Duration>,
    pulled: Arc<AtomicUsize>,
}

impl ScriptedGenerator {
    pub fn new(steps: Vec<GenerationStep>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    /// One appended chunk per step.
    pub fn from_chunks(chunks: &[&str]) -> Self {
        Self::new(chunks.iter().map(|c| GenerationStep::append(*c)).collect())
    }

    /// Yield an error instead of step `index`, ending the stream.
    pub fn fail_at(mut self, index: usize, error: impl Into<String>) -> Self {
        self.fail_at = Some((index, error.into()));
        self
    }

    /// Sleep before every step.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of steps produced so far across all calls.
    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, _request: GenerationRequest) -> Result<StepStream, GenerationError> {
        let (tx, rx) = mpsc::channel(1);
        let steps = self.steps.clone();
        let fail_at = self.fail_at.clone();
        let delay = self.delay;
        let pulled = Arc::clone(&self.pulled);

        tokio::spawn(async move {
            let total = match &fail_at {
                Some((index, _)) => (*index).min(steps.len()),
                None => steps.len(),
            };

            for step in steps.into_iter().take(total) {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                pulled.fetch_add(1, Ordering::SeqCst);
                if tx.send(Ok(step)).await.is_err() {
                    return;
                }
            }

            if let Some((_, error)) = fail_at {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let _ = tx.send(Err(GenerationError::new(error))).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
