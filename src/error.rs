//! Nominee Error Types

use thiserror::Error;

/// Result type alias for Nominee operations
pub type Result<T> = std::result::Result<T, Error>;

/// Nominee error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Record errors
    #[error("Record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    // Coordination backend errors
    #[error("Connection failed to {endpoints}: {reason}")]
    ConnectionFailed { endpoints: String, reason: String },

    #[error("Coordination session lost")]
    SessionLost,

    #[error("Campaign failed: {0}")]
    Campaign(String),

    #[error("Election error: {0}")]
    Election(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    // Managed collaborator errors
    #[error("Node transition failed: {0}")]
    Node(String),

    #[error("Proxy publish failed: {0}")]
    Proxy(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("Already running")]
    AlreadyRunning,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. } | Error::SessionLost | Error::Proxy(_)
        )
    }

    /// Check if this error is the result of a cancelled run context
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::ShuttingDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let connect = Error::ConnectionFailed {
            endpoints: "127.0.0.1:2379".into(),
            reason: "refused".into(),
        };
        assert!(connect.is_retryable());
        assert!(Error::SessionLost.is_retryable());
        assert!(Error::Proxy("rejected".into()).is_retryable());

        assert!(!Error::Node("promote".into()).is_retryable());
        assert!(!Error::Protocol("kind 7".into()).is_retryable());
        assert!(Error::Cancelled.is_cancelled());
    }

    #[test]
    fn test_display_names_endpoints() {
        let err = Error::ConnectionFailed {
            endpoints: "a:2379,b:2379".into(),
            reason: "timeout".into(),
        };
        assert_eq!(err.to_string(), "Connection failed to a:2379,b:2379: timeout");
    }
}
