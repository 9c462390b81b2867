// src/error.rs
// Standardized error type for mira-memory.

use thiserror::Error;

/// Main error type for the memory engine.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid embedding dimension: {0}")]
    InvalidDimension(String),

    #[error("incompatible store schema: {0}")]
    SchemaIncompatible(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

impl MemoryError {
    /// Convert to a user-facing string for CLI / tool boundaries.
    pub fn to_user_string(&self) -> String {
        self.to_string()
    }
}

impl From<String> for MemoryError {
    fn from(s: String) -> Self {
        MemoryError::Other(s)
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            MemoryError::Cancelled
        } else {
            MemoryError::Other(err.to_string())
        }
    }
}

impl From<MemoryError> for String {
    fn from(err: MemoryError) -> Self {
        err.to_string()
    }
}
