//! Client error types.

use engine_core::{CallError, HandshakeError};
use std::time::Duration;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("client closed")]
    Closed,
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) | ClientError::ConnectTimeout(_) => true,
            ClientError::Handshake(e) => matches!(
                e,
                HandshakeError::Timeout(_) | HandshakeError::Closed | HandshakeError::Io(_)
            ),
            ClientError::Call(e) => e.is_retryable(),
            ClientError::Json(_) | ClientError::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ClientError::ConnectTimeout(Duration::from_secs(1)).is_retryable());
        assert!(ClientError::Call(CallError::ConnectionLost("gone".into())).is_retryable());
        assert!(!ClientError::Call(CallError::MethodNotFound("x".into())).is_retryable());
        assert!(!ClientError::Handshake(HandshakeError::Rejected("no".into())).is_retryable());
        assert!(!ClientError::Closed.is_retryable());
    }
}
