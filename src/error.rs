use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for jumpgate operations
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Error types for the jumpgate library
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Credentials were rejected by the jump host
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Jump host unreachable or connection timed out
    #[error("Connect error: {0}")]
    Connect(String),

    /// Protocol-level failure after the connection was established
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bind address/port already claimed or in use
    #[error("Bind conflict: {0}")]
    BindConflict(String),

    /// Malformed or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy reported on the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Connect,
    Transport,
    BindConflict,
    Configuration,
}

impl TunnelError {
    /// Classify this error into the reported taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Authentication(_) => ErrorKind::Authentication,
            TunnelError::Connect(_) => ErrorKind::Connect,
            TunnelError::Transport(_) | TunnelError::Io(_) => ErrorKind::Transport,
            TunnelError::BindConflict(_) => ErrorKind::BindConflict,
            TunnelError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// The message without its category prefix
    pub fn message(&self) -> String {
        match self {
            TunnelError::Authentication(msg)
            | TunnelError::Connect(msg)
            | TunnelError::Transport(msg)
            | TunnelError::BindConflict(msg)
            | TunnelError::Configuration(msg) => msg.clone(),
            TunnelError::Io(e) => e.to_string(),
        }
    }

    /// Rebuild an error from its reported kind and message
    pub fn with_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match kind {
            ErrorKind::Authentication => TunnelError::Authentication(msg),
            ErrorKind::Connect => TunnelError::Connect(msg),
            ErrorKind::Transport => TunnelError::Transport(msg),
            ErrorKind::BindConflict => TunnelError::BindConflict(msg),
            ErrorKind::Configuration => TunnelError::Configuration(msg),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        TunnelError::Configuration(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        TunnelError::Transport(msg.into())
    }
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => TunnelError::Connect(e.to_string()),
            other => TunnelError::Transport(other.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Connect => "ConnectError",
            ErrorKind::Transport => "TransportError",
            ErrorKind::BindConflict => "BindConflictError",
            ErrorKind::Configuration => "ConfigurationError",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            TunnelError::Authentication("denied".into()).kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            TunnelError::BindConflict("8080".into()).kind(),
            ErrorKind::BindConflict
        );
        let io = std::io::Error::other("broken pipe");
        assert_eq!(TunnelError::from(io).kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_error_display() {
        let err = TunnelError::Connect("timed out after 5s".into());
        assert_eq!(err.to_string(), "Connect error: timed out after 5s");
        assert_eq!(ErrorKind::BindConflict.to_string(), "BindConflictError");
        assert_eq!(err.message(), "timed out after 5s");
    }

    #[test]
    fn test_with_kind_keeps_message() {
        let err = TunnelError::with_kind(ErrorKind::Authentication, "denied");
        assert!(matches!(err, TunnelError::Authentication(ref m) if m == "denied"));
    }
}
