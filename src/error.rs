//! Error taxonomy for the digest orchestrator.
//!
//! Validation and conflict errors are returned synchronously to whoever
//! triggered the work. Collaborator and timeout errors raised inside a
//! background job never reach the trigger; the job manager stores their
//! message verbatim on the job record instead.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Bad job name, task id, date or configuration value.
    #[error("validation error: {0}")]
    Validation(String),

    /// A run of the same job is already in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A scraper, capture feed or the persistence store failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// A job exceeded its soft deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn collaborator(msg: impl Into<String>) -> Self {
        Self::Collaborator(msg.into())
    }

    /// Coarse classification used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::Timeout(_) => "timeout",
            Self::Collaborator(_) | Self::Io(_) | Self::Serialization(_) | Self::Http(_) => {
                "collaborator"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_classify_as_collaborator() {
        let err: AppError = std::io::Error::other("disk full").into();
        assert_eq!(err.kind(), "collaborator");
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_display_keeps_message_verbatim() {
        let err = AppError::Timeout("scrape_articles exceeded 30s".to_string());
        assert_eq!(err.to_string(), "timeout: scrape_articles exceeded 30s");
        assert_eq!(err.kind(), "timeout");
    }
}
