//! Error types for the tandem runtime.
//!
//! Every fallible operation in the crate returns [`TandemError`]. The enum is
//! `Clone` because a single connection failure is handed to every call that
//! was waiting on that connection.

use crate::protocol::ErrorObject;
use std::io::ErrorKind;
use thiserror::Error;

/// Main error type for the tandem runtime.
#[derive(Debug, Clone, Error)]
pub enum TandemError {
    // Connection lifecycle
    #[error("connection may be shutdown")]
    Shutdown,

    #[error("transport error ({kind:?}): {message}")]
    Transport { kind: ErrorKind, message: String },

    // Serialization errors
    #[error("codec error: {message}")]
    Codec { message: String },

    // Well-formed error responses from the peer
    #[error("remote error {}: {}", .0.code, .0.message)]
    Remote(ErrorObject),

    // Call context
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("call cancelled")]
    Cancelled,

    // Binding errors
    #[error("invalid descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("stub is not bound to a remote method")]
    UnboundStub,

    // Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for tandem operations.
pub type Result<T> = std::result::Result<T, TandemError>;

impl From<std::io::Error> for TandemError {
    fn from(err: std::io::Error) -> Self {
        TandemError::Transport {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TandemError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            return TandemError::Transport {
                kind: err.io_error_kind().unwrap_or(ErrorKind::Other),
                message: err.to_string(),
            };
        }
        TandemError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<ErrorObject> for TandemError {
    fn from(err: ErrorObject) -> Self {
        TandemError::Remote(err)
    }
}

impl TandemError {
    /// Whether this error means the underlying stream is gone.
    ///
    /// Terminal errors flip a connection to closed and invalidate the pool
    /// slot that produced it. Everything else (codec failures, remote errors,
    /// deadlines) leaves the connection usable.
    pub fn is_terminal(&self) -> bool {
        match self {
            TandemError::Shutdown => true,
            TandemError::Transport { kind, .. } => is_disconnect(*kind),
            _ => false,
        }
    }

    /// Protocol error code carried by a remote error, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            TandemError::Remote(obj) => Some(obj.code),
            _ => None,
        }
    }

    pub(crate) fn invalid_descriptor(reason: impl Into<String>) -> Self {
        TandemError::InvalidDescriptor {
            reason: reason.into(),
        }
    }
}

/// EOF and broken-pipe class I/O failures.
pub(crate) fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::WriteZero
    )
}
