//! Unified error type shared across Taskline crates.

use thiserror::Error;

/// Infrastructure errors raised while loading configuration, installing the
/// log subscriber or opening the database pool.
///
/// The job engine's `JobError` converts from this type so these failures
/// propagate with `?`.
#[derive(Error, Debug)]
pub enum TasklineError {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = TasklineError::Database("Failed to connect: refused".to_string());
        assert_eq!(err.to_string(), "Database error: Failed to connect: refused");
    }

    #[test]
    fn test_from_anyhow() {
        let err: TasklineError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, TasklineError::Other(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
