//! Colloquy application binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Initialize tracing
//! 3. Open the SQLite database
//! 4. Either run a one-shot command or serve the HTTP API until Ctrl-C

mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use colloquy_api::state::AppState;
use colloquy_api::start_server;
use colloquy_chat::ExtractiveGenerator;
use colloquy_core::config::ColloquyConfig;
use colloquy_core::error::ColloquyError;
use colloquy_storage::{Database, DocumentRepository, DocumentStore};

use cli::{CliArgs, Command};

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

/// Parse `--metadata` into a JSON object.
fn parse_metadata(
    raw: Option<&str>,
) -> Result<serde_json::Map<String, serde_json::Value>, ColloquyError> {
    match raw {
        None => Ok(serde_json::Map::new()),
        Some(raw) => match serde_json::from_str::<serde_json::Value>(raw)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(ColloquyError::InvalidInput(
                "--metadata must be a JSON object".to_string(),
            )),
        },
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = ColloquyConfig::load_or_default(&config_file);
    config.general.port = args.resolve_port(config.general.port);
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    if let Some(level) = args.resolve_log_level() {
        config.general.log_level = level;
    }

    // Tracing: RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Colloquy v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration loaded");
    config.validate()?;

    // Storage.
    let data_dir = resolve_data_dir(&config.general.data_dir);
    let db_path = data_dir.join(&config.storage.database_file);
    let db = Database::new(&db_path)?;
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    match args.command() {
        Command::UpsertDocument { url, metadata } => {
            let metadata_map = parse_metadata(metadata.as_deref())?;
            let documents = DocumentRepository::new(Arc::new(db));
            let document = documents.upsert_document_by_url(&url, metadata_map)?;
            tracing::info!(document_id = %document.id, url = %url, "Document upserted");
            println!("{}", document.id);
        }
        Command::Serve => {
            let state = AppState::new(config.clone(), db, Arc::new(ExtractiveGenerator::new()));
            if let Err(e) = start_server(&config, state, shutdown_signal()).await {
                tracing::error!(
                    addr = %format!("{}:{}", config.general.bind_address, config.general.port),
                    error = %e,
                    "API server failed"
                );
                return Err(e.into());
            }
        }
    }

    Ok(())
}
