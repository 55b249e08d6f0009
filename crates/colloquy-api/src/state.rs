//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use colloquy_chat::{ChatEngine, ConversationAggregator, Generator};
use colloquy_core::config::ColloquyConfig;
use colloquy_storage::{
    ConversationRepository, ConversationStore, Database, DocumentRepository, DocumentStore,
};

/// Shared application state.
///
/// All fields are cheap to clone; the engine carries its own shared
/// single-flight registry.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ColloquyConfig>,
    pub documents: Arc<dyn DocumentStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub engine: ChatEngine,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Wire the SQLite stores, aggregator and engine around one database.
    pub fn new(config: ColloquyConfig, database: Database, generator: Arc<dyn Generator>) -> Self {
        let database = Arc::new(database);
        let documents: Arc<dyn DocumentStore> =
            Arc::new(DocumentRepository::new(Arc::clone(&database)));
        let conversations: Arc<dyn ConversationStore> =
            Arc::new(ConversationRepository::new(database));
        let aggregator =
            ConversationAggregator::new(Arc::clone(&conversations), Arc::clone(&documents));
        let engine = ChatEngine::new(aggregator, generator, config.chat.clone());

        Self {
            config: Arc::new(config),
            documents,
            conversations,
            engine,
            start_time: Instant::now(),
        }
    }

    pub fn aggregator(&self) -> &ConversationAggregator {
        self.engine.aggregator()
    }
}
