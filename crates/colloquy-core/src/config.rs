use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ColloquyError, Result};

/// Top-level configuration for the Colloquy server.
///
/// Loaded from `~/.colloquy/config.toml` by default. Every section falls
/// back to its defaults when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColloquyConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl ColloquyConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ColloquyConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing
    /// or invalid.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.general.port == 0 {
            return Err(ColloquyError::Config("general.port must be non-zero".into()));
        }
        if self.storage.database_file.trim().is_empty() {
            return Err(ColloquyError::Config(
                "storage.database_file must not be empty".into(),
            ));
        }
        if self.chat.stream_buffer == 0 {
            return Err(ColloquyError::Config(
                "chat.stream_buffer must be at least 1".into(),
            ));
        }
        if self.chat.step_timeout_secs == 0 {
            return Err(ColloquyError::Config(
                "chat.step_timeout_secs must be at least 1".into(),
            ));
        }
        if self.chat.max_message_length == 0 {
            return Err(ColloquyError::Config(
                "chat.max_message_length must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// General server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// HTTP listen port.
    pub port: u16,
    /// HTTP listen address.
    pub bind_address: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.colloquy/data".to_string(),
            log_level: "info".to_string(),
            port: 8000,
            bind_address: "127.0.0.1".to_string(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file name, relative to `general.data_dir`.
    pub database_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: "colloquy.db".to_string(),
        }
    }
}

/// Chat session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Maximum accepted user message length in characters.
    pub max_message_length: usize,
    /// Events buffered between the engine and a slow consumer.
    pub stream_buffer: usize,
    /// Seconds to wait for the next generation step before failing.
    pub step_timeout_secs: u64,
    /// Most recent messages handed to the generator as history.
    pub context_messages: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_length: 4000,
            stream_buffer: 32,
            step_timeout_secs: 60,
            context_messages: 20,
        }
    }
}

/// HTTP surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// SSE keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
    /// Extra CORS origins allowed besides localhost on the configured port.
    pub allowed_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 15,
            max_body_bytes: 1024 * 1024,
            allowed_origins: vec![],
        }
    }
}
