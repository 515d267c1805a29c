//! Error types for piped

use thiserror::Error;

/// Main error type for piped
#[derive(Error, Debug)]
pub enum PipedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// The requested resource does not exist (revision, service, deployment...)
    #[error("Not found: {0}")]
    NotFound(String),

    /// A concurrent operation is already in flight on the same resource
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A transient failure that is safe to retry
    #[error("Retryable error: {0}")]
    Retryable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A user supplied command exited with a non-zero status
    #[error("User script error: {0}")]
    UserScript(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipedError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PipedError::NotFound(_))
    }

    /// Whether a bounded retry may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PipedError::Retryable(_) | PipedError::Conflict(_) => true,
            PipedError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

impl PipedError {
    /// Rebuild an equivalent error, used where one failure is handed to several callers.
    /// Wrapped library errors lose their source and become `Internal`.
    pub fn replicate(&self) -> PipedError {
        match self {
            PipedError::NotFound(m) => PipedError::NotFound(m.clone()),
            PipedError::Conflict(m) => PipedError::Conflict(m.clone()),
            PipedError::Retryable(m) => PipedError::Retryable(m.clone()),
            PipedError::Config(m) => PipedError::Config(m.clone()),
            PipedError::UserScript(m) => PipedError::UserScript(m.clone()),
            PipedError::Cancelled(m) => PipedError::Cancelled(m.clone()),
            PipedError::Timeout(m) => PipedError::Timeout(m.clone()),
            PipedError::Fatal(m) => PipedError::Fatal(m.clone()),
            PipedError::Git(m) => PipedError::Git(m.clone()),
            PipedError::Validation(m) => PipedError::Validation(m.clone()),
            PipedError::Shutdown(m) => PipedError::Shutdown(m.clone()),
            other => PipedError::Internal(other.to_string()),
        }
    }
}
