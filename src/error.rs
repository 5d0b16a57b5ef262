//! WolfSync Error Types

use thiserror::Error;

/// Result type alias for WolfSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Configuration serialization failed: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Argument errors
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    // Remote store errors
    #[error("Remote store rejected write to {table}: {reason}")]
    Remote { table: String, reason: String },

    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    // Channel errors
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_) | Error::Broadcast(_))
    }

    /// Check if this error came back from the remote store
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote { .. } | Error::RemoteUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::RemoteUnavailable("down".into()).is_retryable());
        assert!(!Error::InvalidKey("empty".into()).is_retryable());

        let rejected = Error::Remote {
            table: "todos".into(),
            reason: "duplicate key".into(),
        };
        assert!(rejected.is_remote());
        assert!(!rejected.is_retryable());
        assert_eq!(
            rejected.to_string(),
            "Remote store rejected write to todos: duplicate key"
        );
    }
}
