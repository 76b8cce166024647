//! Error types for cache operations

use thiserror::Error;

/// Main error type for pyramid and cell cache operations
///
/// The type is `Clone` because a single failed fetch is reported to every
/// caller that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Persist failed for {} cell(s): {failed:?}", failed.len())]
    PartialPersist { failed: Vec<Vec<usize>> },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl CacheError {
    /// Whether a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Transport(_) | CacheError::PartialPersist { .. })
    }
}

/// Specialized Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}
