//! Router setup with all API routes and middleware.
//!
//! Configures the axum Router with CORS, tracing, compression,
//! and all endpoint handlers.

use std::future::Future;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use colloquy_core::config::ColloquyConfig;
use colloquy_core::error::ColloquyError;

use crate::handlers;
use crate::state::AppState;

/// Origins allowed by CORS: the configured list, or the local server itself.
fn allowed_origins(config: &ColloquyConfig) -> Vec<HeaderValue> {
    let origins: Vec<String> = if config.api.allowed_origins.is_empty() {
        let port = config.general.port;
        vec![
            format!("http://127.0.0.1:{}", port),
            format!("http://localhost:{}", port),
        ]
    } else {
        config.api.allowed_origins.clone()
    };

    origins
        .into_iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect()
}

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins(&state.config)))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    let conversation_routes = Router::new()
        .route("/api/conversation", post(handlers::create_conversation))
        .route("/api/conversation/", post(handlers::create_conversation))
        .route(
            "/api/conversation/{conversation_id}",
            get(handlers::get_conversation).delete(handlers::delete_conversation),
        )
        .route(
            "/api/conversation/{conversation_id}/message",
            get(handlers::send_message),
        )
        .route(
            "/api/conversation/{conversation_id}/message/{message_id}",
            get(handlers::get_message),
        );

    let document_routes = Router::new()
        .route("/api/document", get(handlers::list_documents))
        .route("/api/document/", get(handlers::list_documents))
        .route("/api/document/ingest-pdf", post(handlers::ingest_pdf))
        .route("/api/document/{document_id}", get(handlers::get_document));

    let max_body = state.config.api.max_body_bytes;

    Router::new()
        .route("/health", get(handlers::health))
        .merge(conversation_routes)
        .merge(document_routes)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on the configured address until `shutdown` resolves.
///
/// Sessions still streaming when shutdown starts are allowed to finish.
pub async fn start_server<F>(
    config: &ColloquyConfig,
    state: AppState,
    shutdown: F,
) -> Result<(), ColloquyError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.general.bind_address, config.general.port);
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}
