use std::path::PathBuf;

use streamrelay_engine::{CacheError, RelayError, ResolveError, ServerError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Manifest error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("JSON output error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
