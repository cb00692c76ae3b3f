//! # engine-core
//!
//! Connection machinery shared by Engine API servers and clients.
//!
//! This crate provides:
//! - Unix socket and TCP transports behind one stream type
//! - The `engine.hello` handshake with version, identity and format checks
//! - A pending call registry with deadlines and loss fan-out
//! - A method dispatcher with bounded concurrency and streaming replies
//! - A heartbeat liveness monitor
//! - The session driver tying them together on one connection

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod liveness;
pub mod registry;
pub mod session;
pub mod transport;
pub mod writer;

pub use config::{Identity, RpcConfig};
pub use dispatcher::{CallContext, Handler, HandlerResult, Handlers};
pub use error::{CallError, ErrorKind, HandlerError};
pub use handshake::{client_handshake, server_handshake, HandshakeError, Negotiated, SessionInfo};
pub use registry::{CallEvent, PendingCall, PendingCalls};
pub use session::{
    spawn_session, CloseReason, ConnectionState, SessionHandle, TrafficCounters, TrafficSnapshot,
};
pub use transport::{Endpoint, EndpointAddr, EngineListener, EngineStream};
