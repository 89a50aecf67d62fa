use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or out-of-order negotiation message
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// The media transport reported a connectivity failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// No negotiation progress within the configured window
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Reconnection attempts exhausted
    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    /// A quality decision could not be applied to the transport
    #[error("Adaptation error: {0}")]
    Adaptation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Category used when the error is surfaced on the event bus
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Signaling(_) => ErrorKind::Signaling,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Capacity(_) => ErrorKind::Capacity,
            Self::Adaptation(_) => ErrorKind::Adaptation,
            Self::NotFound(_) | Self::InvalidInput(_) | Self::Config(_) => ErrorKind::Invalid,
        }
    }

    /// Transport and timeout failures are recovered by reconnecting
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Serializable error category carried by `connection-error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Signaling,
    Transport,
    Timeout,
    Capacity,
    Adaptation,
    Invalid,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::Signaling("x".into()).kind(), ErrorKind::Signaling);
        assert_eq!(Error::Timeout("x".into()).kind(), ErrorKind::Timeout);
        assert_eq!(Error::NotFound("x".into()).kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Transport("ice failed".into()).is_retryable());
        assert!(Error::Timeout("no answer".into()).is_retryable());
        assert!(!Error::Signaling("bad answer".into()).is_retryable());
        assert!(!Error::Capacity("exhausted".into()).is_retryable());
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::Capacity).unwrap();
        assert_eq!(json, "\"capacity\"");
    }
}
