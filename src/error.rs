use thiserror::Error;

/// Main error type for Paperflow
#[derive(Error, Debug)]
pub enum PaperflowError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Document store errors (infrastructure, not content)
    #[error("Store error: {0}")]
    Store(String),

    /// Extraction pipeline errors (parser service / LLM)
    #[error("Extraction error: {0}")]
    Extraction(#[from] crate::extract::ExtractError),

    /// Paper not found
    #[error("Paper not found: {0}")]
    PaperNotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Convenient Result type using PaperflowError
pub type Result<T> = std::result::Result<T, PaperflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PaperflowError::Config("Test error".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: PaperflowError = rusqlite_err.into();
        assert!(matches!(err, PaperflowError::Database(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PaperflowError = io_err.into();
        assert!(matches!(err, PaperflowError::Io(_)));
    }
}
