//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
///
/// Every variant is fatal for the connection that produced it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether this is a framing error (the byte stream itself is
    /// unusable) as opposed to a well-formed payload with a bad envelope.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. } | ProtocolError::MalformedPayload(_)
        )
    }
}

/// Stable error codes carried in error responses.
///
/// Values follow JSON-RPC 2.0 where a standard code exists. These codes are
/// part of the protocol contract and must remain stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ErrorCode {
    /// Payload could not be parsed.
    ParseError,
    /// Envelope failed validation.
    InvalidRequest,
    /// No handler is registered for the method.
    MethodNotFound,
    /// Parameters did not match what the handler expects.
    InvalidParams,
    /// The handler failed while executing.
    InternalError,
    /// The handshake was rejected.
    HandshakeFailed,
    /// Application-defined code returned by a handler.
    Application(i32),
}

impl ErrorCode {
    /// Returns the numeric wire value.
    pub fn as_i32(&self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::HandshakeFailed => -32000,
            ErrorCode::Application(code) => *code,
        }
    }

    /// Returns whether a fresh call with the same parameters might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::InternalError)
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32000 => ErrorCode::HandshakeFailed,
            other => ErrorCode::Application(other),
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.as_i32()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::ParseError => write!(f, "PARSE_ERROR"),
            ErrorCode::InvalidRequest => write!(f, "INVALID_REQUEST"),
            ErrorCode::MethodNotFound => write!(f, "METHOD_NOT_FOUND"),
            ErrorCode::InvalidParams => write!(f, "INVALID_PARAMS"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
            ErrorCode::HandshakeFailed => write!(f, "HANDSHAKE_FAILED"),
            ErrorCode::Application(code) => write!(f, "APPLICATION_ERROR({})", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_values() {
        assert_eq!(ErrorCode::MethodNotFound.as_i32(), -32601);
        assert_eq!(ErrorCode::InvalidParams.as_i32(), -32602);
        assert_eq!(ErrorCode::InternalError.as_i32(), -32603);
        assert_eq!(ErrorCode::from(-32601), ErrorCode::MethodNotFound);
        assert_eq!(ErrorCode::from(42), ErrorCode::Application(42));
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::MethodNotFound).unwrap();
        assert_eq!(json, "-32601");

        let parsed: ErrorCode = serde_json::from_str("-32000").unwrap();
        assert_eq!(parsed, ErrorCode::HandshakeFailed);

        let parsed: ErrorCode = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, ErrorCode::Application(7));
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(format!("{}", ErrorCode::MethodNotFound), "METHOD_NOT_FOUND");
        assert_eq!(format!("{}", ErrorCode::HandshakeFailed), "HANDSHAKE_FAILED");
        assert_eq!(
            format!("{}", ErrorCode::Application(12)),
            "APPLICATION_ERROR(12)"
        );
    }

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::InternalError.is_retryable());
        assert!(!ErrorCode::MethodNotFound.is_retryable());
        assert!(!ErrorCode::InvalidParams.is_retryable());
        assert!(!ErrorCode::HandshakeFailed.is_retryable());
    }

    #[test]
    fn test_protocol_error_classification() {
        assert!(ProtocolError::FrameTooLarge { size: 10, max: 5 }.is_framing());
        assert!(ProtocolError::MalformedPayload("bad".into()).is_framing());
        assert!(!ProtocolError::InvalidEnvelope("missing id".into()).is_framing());

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));
    }
}
