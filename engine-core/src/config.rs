//! Runtime settings shared by both ends of a connection.

use engine_protocol::{Compartment, WireFormat, DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION};
use std::time::Duration;

/// Per-connection RPC settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Largest frame payload accepted or produced.
    pub max_frame_size: usize,
    /// Deadline for the whole `engine.hello` exchange.
    pub handshake_timeout: Duration,
    /// Deadline applied to calls that do not specify one.
    pub call_timeout: Duration,
    /// Length of one liveness cycle.
    pub heartbeat_interval: Duration,
    /// How long to wait for any traffic after sending a ping.
    pub pong_timeout: Duration,
    /// Consecutive unanswered pings before the peer is declared dead.
    pub missed_heartbeats: u32,
    /// Upper bound on handlers running at once for one connection.
    pub max_concurrent_handlers: usize,
    /// Handlers that may wait for a worker slot before requests are refused.
    pub max_queued_handlers: usize,
    /// Outbound frames that may queue before senders wait.
    pub write_queue_capacity: usize,
    /// Read buffer size for the socket reader.
    pub read_buffer_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(2),
            missed_heartbeats: 3,
            max_concurrent_handlers: 64,
            max_queued_handlers: 1024,
            write_queue_capacity: 1024,
            read_buffer_size: 8192,
        }
    }
}

impl RpcConfig {
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the liveness cycle, pong deadline and miss threshold together.
    pub fn with_heartbeat(mut self, interval: Duration, pong_timeout: Duration, missed: u32) -> Self {
        self.heartbeat_interval = interval;
        self.pong_timeout = pong_timeout;
        self.missed_heartbeats = missed;
        self
    }

    pub fn with_max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = limit;
        self
    }

    pub fn with_max_queued_handlers(mut self, limit: usize) -> Self {
        self.max_queued_handlers = limit;
        self
    }

    /// Checks relationships between settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(format!(
                "max_frame_size must be between 1 and {}",
                u32::MAX
            ));
        }
        if self.pong_timeout >= self.heartbeat_interval {
            return Err(format!(
                "pong_timeout ({:?}) must be shorter than heartbeat_interval ({:?})",
                self.pong_timeout, self.heartbeat_interval
            ));
        }
        if self.missed_heartbeats == 0 {
            return Err("missed_heartbeats must be at least 1".to_string());
        }
        if self.max_concurrent_handlers == 0 {
            return Err("max_concurrent_handlers must be at least 1".to_string());
        }
        if self.write_queue_capacity == 0 {
            return Err("write_queue_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

/// What this process announces about itself during the handshake.
#[derive(Debug, Clone)]
pub struct Identity {
    pub compartment: Compartment,
    pub protocol_version: u16,
    pub capabilities: Vec<String>,
    /// Payload encodings this side speaks, most preferred first.
    pub wire_formats: Vec<WireFormat>,
}

impl Identity {
    pub fn new(compartment: Compartment) -> Self {
        Self {
            compartment,
            protocol_version: PROTOCOL_VERSION,
            capabilities: Vec::new(),
            wire_formats: vec![WireFormat::MsgPack, WireFormat::Json],
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_wire_formats(mut self, formats: Vec<WireFormat>) -> Self {
        self.wire_formats = formats;
        self
    }

    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RpcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_pong_timeout_must_fit_in_interval() {
        let config = RpcConfig::default().with_heartbeat(
            Duration::from_secs(1),
            Duration::from_secs(1),
            3,
        );
        let err = config.validate().unwrap_err();
        assert!(err.contains("pong_timeout"));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = RpcConfig::default().with_heartbeat(
            Duration::from_secs(5),
            Duration::from_secs(1),
            0,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identity_defaults() {
        let identity = Identity::new(Compartment::Network).with_capabilities(["generate"]);
        assert_eq!(identity.protocol_version, PROTOCOL_VERSION);
        assert_eq!(identity.capabilities, vec!["generate".to_string()]);
        assert_eq!(identity.wire_formats[0], WireFormat::MsgPack);
    }
}
