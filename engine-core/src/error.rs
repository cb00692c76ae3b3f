//! Error types surfaced to callers and handlers.

use engine_protocol::{ErrorCode, ProtocolError, RpcError};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Framing,
    Protocol,
    MethodNotFound,
    InvalidParams,
    Internal,
    HandshakeFailed,
    ConnectionLost,
    Timeout,
    Cancelled,
    /// Application-defined code returned by the remote handler.
    Remote,
}

/// Outcome of a call that did not produce a result.
///
/// Cloneable so that one connection loss can be fanned out to every
/// outstanding call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,

    #[error("remote error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<Value>,
    },
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::Framing(_) => ErrorKind::Framing,
            CallError::Protocol(_) => ErrorKind::Protocol,
            CallError::MethodNotFound(_) => ErrorKind::MethodNotFound,
            CallError::InvalidParams(_) => ErrorKind::InvalidParams,
            CallError::Internal(_) => ErrorKind::Internal,
            CallError::HandshakeFailed(_) => ErrorKind::HandshakeFailed,
            CallError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            CallError::Timeout(_) => ErrorKind::Timeout,
            CallError::Cancelled => ErrorKind::Cancelled,
            CallError::Remote { .. } => ErrorKind::Remote,
        }
    }

    /// Returns whether issuing the same call again might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::ConnectionLost(_) | CallError::Timeout(_) | CallError::Internal(_)
        )
    }
}

impl From<RpcError> for CallError {
    fn from(err: RpcError) -> Self {
        match err.code {
            ErrorCode::ParseError => CallError::Framing(err.message),
            ErrorCode::InvalidRequest => CallError::Protocol(err.message),
            ErrorCode::MethodNotFound => CallError::MethodNotFound(err.message),
            ErrorCode::InvalidParams => CallError::InvalidParams(err.message),
            ErrorCode::InternalError => CallError::Internal(err.message),
            ErrorCode::HandshakeFailed => CallError::HandshakeFailed(err.message),
            ErrorCode::Application(code) => CallError::Remote {
                code,
                message: err.message,
                data: err.data,
            },
        }
    }
}

impl From<ProtocolError> for CallError {
    fn from(err: ProtocolError) -> Self {
        if err.is_framing() {
            CallError::Framing(err.to_string())
        } else {
            CallError::Protocol(err.to_string())
        }
    }
}

/// Failure reported by a method handler.
///
/// Converted into an error response for requests; only logged for
/// notifications.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HandlerError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Internal(String),

    #[error("application error {code}: {message}")]
    Application {
        code: i32,
        message: String,
        data: Option<Value>,
    },
}

impl HandlerError {
    pub fn internal(message: impl ToString) -> Self {
        HandlerError::Internal(message.to_string())
    }

    pub fn application(code: i32, message: impl Into<String>) -> Self {
        HandlerError::Application {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            HandlerError::InvalidParams(msg) => RpcError::invalid_params(msg.clone()),
            HandlerError::Internal(msg) => RpcError::internal(msg.clone()),
            HandlerError::Application {
                code,
                message,
                data,
            } => {
                let err = RpcError::new(ErrorCode::Application(*code), message.clone());
                match data {
                    Some(data) => err.with_data(data.clone()),
                    None => err,
                }
            }
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Internal(err.to_string())
    }
}

// Handlers that forward to another compartment surface downstream failures
// as their own internal error.
impl From<CallError> for HandlerError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Remote {
                code,
                message,
                data,
            } => HandlerError::Application {
                code,
                message,
                data,
            },
            other => HandlerError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rpc_error_maps_to_kind() {
        let err = CallError::from(RpcError::method_not_found("missing"));
        assert_eq!(err.kind(), ErrorKind::MethodNotFound);

        let err = CallError::from(RpcError::invalid_params("bad"));
        assert_eq!(err.kind(), ErrorKind::InvalidParams);

        let err = CallError::from(
            RpcError::new(ErrorCode::Application(4001), "quota").with_data(json!({"left": 0})),
        );
        assert_eq!(
            err,
            CallError::Remote {
                code: 4001,
                message: "quota".to_string(),
                data: Some(json!({"left": 0})),
            }
        );
    }

    #[test]
    fn test_protocol_error_classification() {
        let err = CallError::from(ProtocolError::FrameTooLarge { size: 10, max: 5 });
        assert_eq!(err.kind(), ErrorKind::Framing);

        let err = CallError::from(ProtocolError::InvalidEnvelope("no id".into()));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_retryable() {
        assert!(CallError::ConnectionLost("eof".into()).is_retryable());
        assert!(CallError::Timeout(Duration::from_millis(50)).is_retryable());
        assert!(!CallError::MethodNotFound("x".into()).is_retryable());
        assert!(!CallError::Cancelled.is_retryable());
    }

    #[test]
    fn test_handler_error_to_rpc_error() {
        let rpc = HandlerError::InvalidParams("missing field `model`".into()).to_rpc_error();
        assert_eq!(rpc.code, ErrorCode::InvalidParams);

        let rpc = HandlerError::application(7, "busy").to_rpc_error();
        assert_eq!(rpc.code, ErrorCode::Application(7));
        assert_eq!(rpc.message, "busy");
    }

    #[test]
    fn test_downstream_failure_becomes_internal() {
        let err = HandlerError::from(CallError::ConnectionLost("peer gone".into()));
        assert!(matches!(err, HandlerError::Internal(msg) if msg.contains("peer gone")));
    }
}
