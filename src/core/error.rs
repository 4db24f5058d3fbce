//! Error type system for the offline mirror
//!
//! This module provides:
//! - A single error enum covering storage, configuration and engine failures
//! - Retry classification for storage-side failures

/// Main error type for the offline mirror engine
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Storage errors
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    // Engine errors
    #[error("Invalid download transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    // Writer errors
    #[error("Store writer is not running")]
    WriterClosed,

    #[error("Task error: {0}")]
    TaskError(String),
}

impl MirrorError {
    /// Get the error type name for logs
    pub fn error_type(&self) -> &'static str {
        match self {
            MirrorError::ConfigError(_) => "ConfigError",
            MirrorError::DatabaseError(_) => "DatabaseError",
            MirrorError::PoolError(_) => "PoolError",
            MirrorError::IoError(_) => "IoError",
            MirrorError::SerializationError(_) => "SerializationError",
            MirrorError::InvalidTransition { .. } => "InvalidTransition",
            MirrorError::NotFound(_) => "NotFound",
            MirrorError::ValidationError(_) => "ValidationError",
            MirrorError::WriterClosed => "WriterClosed",
            MirrorError::TaskError(_) => "TaskError",
        }
    }

    /// Check if this error is retryable
    ///
    /// Storage failures leave no partial write behind, so the same call can be issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MirrorError::DatabaseError(_) | MirrorError::PoolError(_) | MirrorError::IoError(_)
        )
    }
}

/// Result type alias for operations that can fail with MirrorError
pub type Result<T> = std::result::Result<T, MirrorError>;
