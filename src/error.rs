//! Error types for the timelog history engine.
//!
//! All fallible operations in this crate return [`HistoryResult`].

use thiserror::Error;

/// Result type alias for history operations
pub type HistoryResult<T> = Result<T, HistoryError>;

/// Main error type for history operations
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),
}

impl HistoryError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        HistoryError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        HistoryError::NotFound(message.into())
    }

    /// Create a new sync error
    pub fn sync(message: impl Into<String>) -> Self {
        HistoryError::Sync(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = HistoryError::validation("category", "cannot be empty");
        assert_eq!(
            err.to_string(),
            "Validation error in category: cannot be empty"
        );
    }

    #[test]
    fn test_not_found_error() {
        let err = HistoryError::not_found("no such entry");
        assert!(matches!(err, HistoryError::NotFound(_)));
    }
}
