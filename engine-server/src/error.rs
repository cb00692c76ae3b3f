//! Server error types.

use engine_core::{EndpointAddr, HandshakeError};
use engine_protocol::ErrorCode;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: EndpointAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("no endpoints to listen on")]
    NoEndpoints,

    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Handshake(_) => ErrorCode::HandshakeFailed,
            ServerError::NoEndpoints => ErrorCode::InvalidRequest,
            ServerError::Bind { .. }
            | ServerError::ConnectionLimit(_)
            | ServerError::ShuttingDown => ErrorCode::InternalError,
        }
    }

    /// Returns whether the error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServerError::ConnectionLimit(_) | ServerError::ShuttingDown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = ServerError::Handshake(HandshakeError::Rejected("nope".into()));
        assert_eq!(err.error_code(), ErrorCode::HandshakeFailed);
        assert!(!err.is_retryable());

        let err = ServerError::ConnectionLimit(4);
        assert_eq!(err.error_code(), ErrorCode::InternalError);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_bind_error_names_endpoint() {
        let err = ServerError::Bind {
            endpoint: EndpointAddr::Tcp("127.0.0.1:1".into()),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("tcp:127.0.0.1:1"));
    }
}
