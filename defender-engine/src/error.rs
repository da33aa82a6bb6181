use thiserror::Error;

/// Errors that can occur in the rule engine library
#[derive(Error, Debug)]
pub enum DefenderError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed rule directive
    #[error("Directive error: {0}")]
    Directive(String),

    /// Match log error
    #[error("Match log error: {0}")]
    MatchLog(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using DefenderError
pub type Result<T> = std::result::Result<T, DefenderError>;

impl From<String> for DefenderError {
    fn from(s: String) -> Self {
        DefenderError::Other(s)
    }
}

impl From<&str> for DefenderError {
    fn from(s: &str) -> Self {
        DefenderError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for DefenderError {
    fn from(err: serde_json::Error) -> Self {
        DefenderError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DefenderError::Config("match log path is empty".to_string());
        assert_eq!(err.to_string(), "Configuration error: match log path is empty");
    }

    #[test]
    fn test_error_from_string() {
        let err: DefenderError = "test error".into();
        assert!(matches!(err, DefenderError::Other(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DefenderError = io_err.into();
        assert!(matches!(err, DefenderError::Io(_)));
    }
}
