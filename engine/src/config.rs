//! Configuration from environment variables.
//!
//! Priority: command-line flags (handled by the server binary via clap)
//! override environment variables, which override built-in defaults. All
//! index tunables live in `index_params` on the library, not here.

use std::path::PathBuf;

use crate::error::{EngineError, Result};

/// Embedding provider settings.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Provider endpoint URL
    pub api_url: String,
    /// Bearer key; embedding requests fail upstream when unset
    pub api_key: Option<String>,
    /// Model identifier sent with every request
    pub model: String,
    /// Per-request timeout (seconds)
    pub timeout_secs: u64,
    /// Maximum texts accepted per request
    pub max_texts: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.cohere.ai/v1/embed".to_string(),
            api_key: None,
            model: "embed-english-v3.0".to_string(),
            timeout_secs: 10,
            max_texts: 128,
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP API port
    pub api_port: u16,
    /// Root directory for durable storage
    pub data_dir: PathBuf,
    /// Database name under the data dir
    pub db_name: String,
    /// TEST_MODE switches to the test database
    pub test_mode: bool,
    pub embedding: EmbeddingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_port: 8080,
            data_dir: PathBuf::from("./data"),
            db_name: "vector_db".to_string(),
            test_mode: false,
            embedding: EmbeddingConfig::default(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl AppConfig {
    /// Build from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_var("SHELFDB_API_PORT") {
            config.api_port = port
                .parse()
                .map_err(|_| EngineError::Validation(format!("invalid SHELFDB_API_PORT '{port}'")))?;
        }
        if let Some(dir) = env_var("SHELFDB_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(name) = env_var("SHELFDB_DB_NAME") {
            config.db_name = name;
        }
        config.test_mode = env_var("TEST_MODE")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);
        if config.test_mode {
            config.db_name = "test".to_string();
        }

        if let Some(url) = env_var("EMBED_API_URL") {
            config.embedding.api_url = url;
        }
        config.embedding.api_key = env_var("EMBED_API_KEY");
        if let Some(model) = env_var("EMBED_MODEL") {
            config.embedding.model = model;
        }
        if let Some(timeout) = env_var("EMBED_TIMEOUT_SECS") {
            config.embedding.timeout_secs = timeout.parse().map_err(|_| {
                EngineError::Validation(format!("invalid EMBED_TIMEOUT_SECS '{timeout}'"))
            })?;
        }
        if let Some(max) = env_var("EMBED_MAX_TEXTS") {
            config.embedding.max_texts = max.parse().map_err(|_| {
                EngineError::Validation(format!("invalid EMBED_MAX_TEXTS '{max}'"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_name.is_empty() {
            return Err(EngineError::Validation("db name must not be empty".into()));
        }
        if self.embedding.timeout_secs == 0 {
            return Err(EngineError::Validation(
                "embedding timeout must be > 0".into(),
            ));
        }
        if self.embedding.max_texts == 0 {
            return Err(EngineError::Validation(
                "embedding max_texts must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Storage root: data dir joined with the database name.
    pub fn data_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_name)
    }
}
