//! The `engine.hello` exchange that opens every connection.
//!
//! Both hello frames are JSON regardless of what is negotiated, so either
//! side can read them before knowing the peer. Every later frame uses the
//! negotiated wire format.

use crate::config::{Identity, RpcConfig};
use crate::transport::Endpoint;
use engine_protocol::message::{HelloParams, HelloResult, HELLO_METHOD};
use engine_protocol::{
    Compartment, Decoder, Encoder, ErrorCode, ErrorResponse, Message, ProtocolError, Request,
    RequestId, Response, RpcError, WireFormat,
};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Id carried by the hello request. Call ids start at 1.
const HELLO_ID: RequestId = 0;

/// Ways a handshake can fail. The connection is unusable afterwards.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake rejected by peer: {0}")]
    Rejected(String),

    #[error("incompatible peer: {0}")]
    Incompatible(String),

    #[error("connection closed during handshake")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// What both sides agreed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Server-assigned identifier, shared by both ends for log correlation.
    pub id: String,
    pub local: Compartment,
    pub peer: Compartment,
    pub wire_format: WireFormat,
    /// Capabilities both sides support.
    pub capabilities: Vec<String>,
}

impl SessionInfo {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }
}

/// A completed handshake.
///
/// The decoder has already been switched to the negotiated format and keeps
/// any bytes that arrived behind the hello reply.
#[derive(Debug)]
pub struct Negotiated {
    pub info: SessionInfo,
    pub decoder: Decoder,
}

/// Runs the dialing side: sends hello, checks the reply against `endpoint`.
pub async fn client_handshake<T>(
    stream: &mut T,
    identity: &Identity,
    endpoint: &Endpoint,
    config: &RpcConfig,
) -> Result<Negotiated, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = config.handshake_timeout;
    tokio::time::timeout(deadline, client_exchange(stream, identity, endpoint, config))
        .await
        .map_err(|_| HandshakeError::Timeout(deadline))?
}

async fn client_exchange<T>(
    stream: &mut T,
    identity: &Identity,
    endpoint: &Endpoint,
    config: &RpcConfig,
) -> Result<Negotiated, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let hello = HelloParams {
        protocol_version: identity.protocol_version,
        compartment: identity.compartment,
        capabilities: identity.capabilities.clone(),
        wire_formats: identity.wire_formats.clone(),
    };
    let params = serde_json::to_value(&hello).map_err(ProtocolError::from)?;
    let request = Request::new(HELLO_ID, HELLO_METHOD).with_params(params);
    write_json(stream, &request.into(), config.max_frame_size).await?;

    let mut decoder = Decoder::new(WireFormat::Json, config.max_frame_size);
    let result: HelloResult = match read_message(stream, &mut decoder, config).await? {
        Message::Response(response) if response.id == HELLO_ID => {
            serde_json::from_value(response.result).map_err(|e| {
                ProtocolError::InvalidEnvelope(format!("bad hello result: {}", e))
            })?
        }
        Message::Error(error) => return Err(HandshakeError::Rejected(error.error.message)),
        other => {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "unexpected message during handshake: {:?}",
                other
            ))
            .into())
        }
    };

    if result.protocol_version != endpoint.protocol_version {
        return Err(HandshakeError::Incompatible(format!(
            "{} speaks protocol version {}, expected {}",
            endpoint.name, result.protocol_version, endpoint.protocol_version
        )));
    }
    if result.compartment != endpoint.peer {
        return Err(HandshakeError::Incompatible(format!(
            "{} answered as {}, expected {}",
            endpoint.name, result.compartment, endpoint.peer
        )));
    }
    let supported = identity.wire_formats.contains(&result.wire_format)
        || result.wire_format == WireFormat::Json;
    if !supported {
        return Err(HandshakeError::Incompatible(format!(
            "peer chose unsupported wire format {}",
            result.wire_format
        )));
    }

    decoder.set_format(result.wire_format);
    tracing::debug!(
        "Handshake with {} complete: session={} format={}",
        endpoint.name,
        result.session_id,
        result.wire_format
    );

    Ok(Negotiated {
        info: SessionInfo {
            id: result.session_id,
            local: identity.compartment,
            peer: result.compartment,
            wire_format: result.wire_format,
            capabilities: result.capabilities,
        },
        decoder,
    })
}

/// Runs the accepting side: validates hello against `endpoint`, replies, and
/// picks the wire format.
///
/// A rejected client is sent a handshake-failed error before this returns.
pub async fn server_handshake<T>(
    stream: &mut T,
    identity: &Identity,
    endpoint: &Endpoint,
    config: &RpcConfig,
) -> Result<Negotiated, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = config.handshake_timeout;
    tokio::time::timeout(deadline, server_exchange(stream, identity, endpoint, config))
        .await
        .map_err(|_| HandshakeError::Timeout(deadline))?
}

async fn server_exchange<T>(
    stream: &mut T,
    identity: &Identity,
    endpoint: &Endpoint,
    config: &RpcConfig,
) -> Result<Negotiated, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let max = config.max_frame_size;
    let mut decoder = Decoder::new(WireFormat::Json, max);

    let request = match read_message(stream, &mut decoder, config).await? {
        Message::Request(request) if request.method == HELLO_METHOD => request,
        other => {
            let reason = "expected engine.hello as the first message".to_string();
            reject(stream, other.id().unwrap_or(HELLO_ID), &reason, max).await;
            return Err(HandshakeError::Incompatible(reason));
        }
    };

    let hello: HelloParams = match serde_json::from_value(request.params) {
        Ok(hello) => hello,
        Err(e) => {
            let reason = format!("bad hello params: {}", e);
            reject(stream, request.id, &reason, max).await;
            return Err(HandshakeError::Incompatible(reason));
        }
    };

    if hello.protocol_version != endpoint.protocol_version {
        let reason = format!(
            "unsupported protocol version {} (expected {})",
            hello.protocol_version, endpoint.protocol_version
        );
        reject(stream, request.id, &reason, max).await;
        return Err(HandshakeError::Incompatible(reason));
    }
    if hello.compartment != endpoint.peer {
        let reason = format!(
            "compartment {} may not connect to {} (expected {})",
            hello.compartment, endpoint.name, endpoint.peer
        );
        reject(stream, request.id, &reason, max).await;
        return Err(HandshakeError::Incompatible(reason));
    }

    let wire_format = if hello.wire_formats.is_empty() {
        WireFormat::Json
    } else {
        match hello
            .wire_formats
            .iter()
            .copied()
            .find(|f| identity.wire_formats.contains(f))
        {
            Some(format) => format,
            None => {
                let reason = "no common wire format".to_string();
                reject(stream, request.id, &reason, max).await;
                return Err(HandshakeError::Incompatible(reason));
            }
        }
    };

    let capabilities: Vec<String> = identity
        .capabilities
        .iter()
        .filter(|c| hello.capabilities.contains(c))
        .cloned()
        .collect();

    let session_id = uuid::Uuid::new_v4().to_string();
    let result = HelloResult {
        protocol_version: identity.protocol_version,
        compartment: identity.compartment,
        capabilities: capabilities.clone(),
        wire_format,
        session_id: session_id.clone(),
    };
    let result = serde_json::to_value(&result).map_err(ProtocolError::from)?;
    write_json(stream, &Response::ok(request.id, result).into(), max).await?;

    decoder.set_format(wire_format);
    tracing::debug!(
        "[{}] Accepted {} on {} format={}",
        session_id,
        hello.compartment,
        endpoint.name,
        wire_format
    );

    Ok(Negotiated {
        info: SessionInfo {
            id: session_id,
            local: identity.compartment,
            peer: hello.compartment,
            wire_format,
            capabilities,
        },
        decoder,
    })
}

async fn reject<T>(stream: &mut T, id: RequestId, reason: &str, max: usize)
where
    T: AsyncWrite + Unpin,
{
    tracing::warn!("Rejecting handshake: {}", reason);
    let error = ErrorResponse::new(id, RpcError::new(ErrorCode::HandshakeFailed, reason));
    if let Err(e) = write_json(stream, &error.into(), max).await {
        tracing::debug!("Failed to send handshake rejection: {}", e);
    }
}

async fn write_json<T>(stream: &mut T, message: &Message, max: usize) -> Result<(), HandshakeError>
where
    T: AsyncWrite + Unpin,
{
    let frame = Encoder::new(WireFormat::Json, max).encode(message)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_message<T>(
    stream: &mut T,
    decoder: &mut Decoder,
    config: &RpcConfig,
) -> Result<Message, HandshakeError>
where
    T: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; config.read_buffer_size];
    loop {
        if let Some(message) = decoder.decode()? {
            return Ok(message);
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(HandshakeError::Closed);
        }
        decoder.extend(&buf[..n]);
    }
}
