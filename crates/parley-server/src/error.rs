//! Server error types.

use std::fmt;

/// Errors that can occur while starting or running the server.
///
/// Per-connection failures never surface here; sessions contain them.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error
    Config(String),

    /// Socket bind or accept failure
    Transport(String),

    /// Internal error
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_becomes_transport() {
        let err = ServerError::from(std::io::Error::from(std::io::ErrorKind::AddrInUse));
        assert!(matches!(err, ServerError::Transport(_)));
        assert!(err.to_string().starts_with("transport error:"));
    }

    #[test]
    fn config_display() {
        let err = ServerError::Config("zero timeout".to_string());
        assert_eq!(err.to_string(), "configuration error: zero timeout");
    }
}
