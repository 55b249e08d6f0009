//! Conversation aggregation and streaming chat sessions for Colloquy.
//!
//! The aggregator turns the store's flat rows into the nested, ordered
//! conversation view. The engine drives one send-message interaction at a
//! time per conversation and streams its progress as ordered events.

pub mod aggregator;
pub mod engine;
pub mod error;
pub mod generation;
pub mod session;
pub mod single_flight;

pub use aggregator::{ConversationAggregator, ConversationBuilder};
pub use engine::{ChatEngine, ChatSession};
pub use error::{ChatError, GenerationError};
pub use generation::{
    ContentUpdate, ExtractiveGenerator, GenerationRequest, GenerationStep, Generator,
    ScriptedGenerator, StepStream,
};
pub use session::SessionState;
pub use single_flight::{InFlightGuard, InFlightRegistry};
