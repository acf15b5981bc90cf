// src/error.rs

//! Unified error handling for the re-crawl pipeline.

use std::fmt;

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Work queue backing store unavailable
    #[error("Queue transport error: {0}")]
    Queue(String),

    /// Transient fetch or parse failure for a single item
    #[error("Fetch error for {context}: {message}")]
    Fetch { context: String, message: String },

    /// Raw payload failed schema validation
    #[error("Normalize error for {id}: {message}")]
    Normalize { id: String, message: String },

    /// Downstream sink rejected a call
    #[error("Sink error: {0}")]
    Sink(String),

    /// A collaborator call exceeded its deadline
    #[error("Timed out after {0:?}: {1}")]
    Timeout(std::time::Duration, String),
}

impl AppError {
    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a queue transport error.
    pub fn queue(message: impl fmt::Display) -> Self {
        Self::Queue(message.to_string())
    }

    /// Create a fetch error with context.
    pub fn fetch(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Fetch {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a normalization error for an item.
    pub fn normalize(id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Normalize {
            id: id.into(),
            message: message.to_string(),
        }
    }

    /// Create a sink error.
    pub fn sink(message: impl fmt::Display) -> Self {
        Self::Sink(message.to_string())
    }

    /// Whether this error means the queue backing store is unavailable.
    ///
    /// Only this class may pause a whole worker loop.
    pub fn is_queue_transport(&self) -> bool {
        matches!(self, Self::Queue(_))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        Self::Queue(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Queue(format!("migration failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_errors_are_transport() {
        assert!(AppError::queue("connection refused").is_queue_transport());
        assert!(!AppError::fetch("item 1", "reset by peer").is_queue_transport());
        assert!(!AppError::sink("503").is_queue_transport());
        assert!(AppError::from(sqlx::Error::PoolTimedOut).is_queue_transport());
    }

    #[test]
    fn test_display_includes_context() {
        let err = AppError::normalize("42", "missing field `id`");
        assert_eq!(err.to_string(), "Normalize error for 42: missing field `id`");
    }
}
