//! Colloquy API crate - axum HTTP server, route handlers, SSE streaming.
//!
//! Exposes conversations, documents and the streaming send-message call
//! over HTTP. Send-message sessions are delivered as Server-Sent Events
//! whose last data event carries the final assistant message.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
