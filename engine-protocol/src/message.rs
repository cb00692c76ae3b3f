//! Message envelope shared by every Engine API transport.
//!
//! The envelope is JSON-RPC 2.0 shaped with an explicit `type` tag:
//!
//! ```text
//! Request:       { type: "request",      id, method, params }
//! Notification:  { type: "notification", method, params }
//! Response:      { type: "response",     id, result, stream? }
//! ErrorResponse: { type: "error",        id, error: { code, message, data? } }
//! ```

use crate::codec::WireFormat;
use crate::error::{ErrorCode, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Correlation key for a call, unique among outstanding calls on one connection.
pub type RequestId = u64;

/// Handshake request, always the first frame a client sends.
pub const HELLO_METHOD: &str = "engine.hello";

/// Liveness probe notification.
pub const PING_METHOD: &str = "engine.ping";

/// Reply to a liveness probe.
pub const PONG_METHOD: &str = "engine.pong";

/// Best-effort request to abort an in-flight handler.
pub const CANCEL_METHOD: &str = "engine.cancel";

/// Prefix reserved for protocol-internal methods.
pub const RESERVED_PREFIX: &str = "engine.";

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
    Error(ErrorResponse),
}

impl Message {
    /// Returns the correlation id, if this message carries one.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Message::Request(r) => Some(r.id),
            Message::Response(r) => Some(r.id),
            Message::Error(e) => Some(e.id),
            Message::Notification(_) => None,
        }
    }

    /// Returns the method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    /// Returns whether this message closes the lifecycle of its id.
    pub fn is_terminal(&self) -> bool {
        match self {
            Message::Response(r) => r.stream == StreamPhase::Terminal,
            Message::Error(_) => true,
            _ => false,
        }
    }

    /// Checks envelope invariants that the type system cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self.method() {
            Some("") => Err(ProtocolError::InvalidEnvelope(
                "method must not be empty".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Message::Notification(notification)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl From<ErrorResponse> for Message {
    fn from(error: ErrorResponse) -> Self {
        Message::Error(error)
    }
}

/// A call expecting a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            params: Value::Object(Default::default()),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// A fire-and-forget message with no reply path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(PING_METHOD, serde_json::json!({ "seq": seq }))
    }

    pub fn pong(seq: u64) -> Self {
        Self::new(PONG_METHOD, serde_json::json!({ "seq": seq }))
    }

    pub fn cancel(id: RequestId) -> Self {
        Self::new(CANCEL_METHOD, serde_json::json!({ "id": id }))
    }
}

/// Position of a response within its call's stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    /// More responses follow for the same id.
    Partial,
    /// Last response for the id.
    #[default]
    Terminal,
}

impl StreamPhase {
    pub fn is_terminal(&self) -> bool {
        *self == StreamPhase::Terminal
    }
}

/// A successful (partial or final) result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "StreamPhase::is_terminal")]
    pub stream: StreamPhase,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result,
            stream: StreamPhase::Terminal,
        }
    }

    pub fn partial(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result,
            stream: StreamPhase::Partial,
        }
    }
}

/// Error details in an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Stable error code.
    pub code: ErrorCode,

    /// Human-readable error message.
    pub message: String,

    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("method not found: {}", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A failed call. Always terminal for its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub id: RequestId,
    pub error: RpcError,
}

impl ErrorResponse {
    pub fn new(id: RequestId, error: RpcError) -> Self {
        Self { id, error }
    }
}

// ============================================================================
// Handshake and control parameter types
// ============================================================================

/// Compartment identities that may take part in the Engine API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compartment {
    /// Network stack (the coordinator process).
    Network,
    /// Application stack (task execution, inference).
    Application,
    /// Consensus stack (chain interaction, scoring).
    Consensus,
}

impl fmt::Display for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compartment::Network => write!(f, "network"),
            Compartment::Application => write!(f, "application"),
            Compartment::Consensus => write!(f, "consensus"),
        }
    }
}

/// Parameters for the `engine.hello` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: u16,
    pub compartment: Compartment,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Payload encodings the client can speak, most preferred first.
    #[serde(default)]
    pub wire_formats: Vec<WireFormat>,
}

/// Result of the `engine.hello` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: u16,
    pub compartment: Compartment,
    /// Capabilities both sides support.
    pub capabilities: Vec<String>,
    /// Encoding used for every frame after the handshake.
    pub wire_format: WireFormat,
    /// Server-assigned session identifier, for log correlation.
    pub session_id: String,
}

/// Parameters for `engine.ping` / `engine.pong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingParams {
    pub seq: u64,
}

/// Parameters for `engine.cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RequestId,
}
