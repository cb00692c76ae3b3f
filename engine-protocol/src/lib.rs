//! # engine-protocol
//!
//! Wire protocol for the Engine API, the RPC substrate connecting node
//! compartments (network, application, consensus).
//!
//! This crate provides:
//! - Length-prefixed framing with a configurable maximum frame size
//! - MessagePack and JSON payload encodings behind one codec
//! - The request / notification / response / error envelope
//! - Stable error codes and handshake parameter types

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder, WireFormat};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, LENGTH_PREFIX_SIZE};
pub use message::{
    Compartment, ErrorResponse, Message, Notification, Request, RequestId, Response, RpcError,
    StreamPhase,
};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default maximum frame payload size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
