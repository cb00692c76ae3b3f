//! Node configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via ENGINE_CONFIG)
//! 3. Environment variables

use engine_core::{Endpoint, EndpointAddr, Identity, RpcConfig};
use engine_protocol::{Compartment, WireFormat, DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Who this node is.
    pub node: NodeConfig,
    /// Endpoints this node accepts connections on.
    pub listen: Vec<Endpoint>,
    /// Endpoints this node dials.
    pub peers: Vec<Endpoint>,
    /// Per-connection RPC settings.
    pub rpc: RpcSettings,
    /// Reconnect backoff for dialed peers.
    pub backoff: BackoffSettings,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("ENGINE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.node.apply_env_overrides();
        self.rpc.apply_env_overrides();
        self.backoff.apply_env_overrides();

        if let Ok(addr) = std::env::var("ENGINE_LISTEN") {
            match addr.parse::<EndpointAddr>() {
                Ok(parsed) => match self.listen.first_mut() {
                    Some(endpoint) => endpoint.addr = parsed,
                    None => self
                        .listen
                        .push(Endpoint::new("default", parsed, Compartment::Network)),
                },
                Err(e) => tracing::warn!("Ignoring ENGINE_LISTEN: {}", e),
            }
        }

        if let Ok(addr) = std::env::var("ENGINE_PEER_ADDR") {
            match addr.parse::<EndpointAddr>() {
                Ok(parsed) => {
                    if let Some(endpoint) = self.peers.first_mut() {
                        endpoint.addr = parsed;
                    }
                }
                Err(e) => tracing::warn!("Ignoring ENGINE_PEER_ADDR: {}", e),
            }
        }
    }

    /// Checks the configuration for values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rpc
            .to_rpc_config()
            .validate()
            .map_err(ConfigError::ValidationError)?;
        self.backoff.validate()?;

        if self.rpc.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "rpc.max_connections must be at least 1".to_string(),
            ));
        }
        if self.node.wire_formats.is_empty() {
            return Err(ConfigError::ValidationError(
                "node.wire_formats must name at least one format".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for endpoint in self.listen.iter().chain(self.peers.iter()) {
            if !names.insert(endpoint.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate endpoint name '{}'",
                    endpoint.name
                )));
            }
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// The identity announced in handshakes.
    pub fn identity(&self) -> Identity {
        Identity::new(self.node.compartment)
            .with_protocol_version(self.node.protocol_version)
            .with_capabilities(self.node.capabilities.iter().cloned())
            .with_wire_formats(self.node.wire_formats.clone())
    }
}

/// Node identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub compartment: Compartment,
    pub protocol_version: u16,
    pub capabilities: Vec<String>,
    /// Payload encodings offered or accepted, most preferred first.
    pub wire_formats: Vec<WireFormat>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            compartment: Compartment::Application,
            protocol_version: PROTOCOL_VERSION,
            capabilities: vec!["generate".to_string()],
            wire_formats: vec![WireFormat::MsgPack, WireFormat::Json],
        }
    }
}

impl NodeConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(compartment) = std::env::var("ENGINE_COMPARTMENT") {
            match compartment.to_lowercase().as_str() {
                "network" => self.compartment = Compartment::Network,
                "application" => self.compartment = Compartment::Application,
                "consensus" => self.compartment = Compartment::Consensus,
                other => tracing::warn!("Ignoring unknown ENGINE_COMPARTMENT '{}'", other),
            }
        }

        if let Ok(caps) = std::env::var("ENGINE_CAPABILITIES") {
            self.capabilities = caps
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(formats) = std::env::var("ENGINE_WIRE_FORMATS") {
            let parsed: Result<Vec<WireFormat>, _> = formats
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::parse)
                .collect();
            match parsed {
                Ok(formats) => self.wire_formats = formats,
                Err(e) => tracing::warn!("Ignoring ENGINE_WIRE_FORMATS: {}", e),
            }
        }
    }
}

/// RPC settings, in the units used in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    /// Maximum frame payload size in bytes.
    pub max_frame_size: usize,
    pub handshake_timeout_ms: u64,
    /// Deadline for calls that do not set one.
    pub call_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    /// Consecutive missed heartbeats before a peer is declared dead.
    pub missed_heartbeats: u32,
    /// Handler concurrency limit per connection.
    pub max_concurrent_handlers: usize,
    /// Handlers per connection that may wait for a free worker.
    pub max_queued_handlers: usize,
    /// Maximum concurrent inbound connections per server.
    pub max_connections: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout_ms: 5_000,
            call_timeout_ms: 30_000,
            heartbeat_interval_ms: 5_000,
            pong_timeout_ms: 2_000,
            missed_heartbeats: 3,
            max_concurrent_handlers: 64,
            max_queued_handlers: 1024,
            max_connections: 1000,
        }
    }
}

impl RpcSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ENGINE_MAX_FRAME_SIZE") {
            if let Ok(n) = v.parse() {
                self.max_frame_size = n;
            }
        }
        if let Ok(v) = std::env::var("ENGINE_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.handshake_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("ENGINE_CALL_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.call_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("ENGINE_HEARTBEAT_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.heartbeat_interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("ENGINE_PONG_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.pong_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("ENGINE_MISSED_HEARTBEATS") {
            if let Ok(n) = v.parse() {
                self.missed_heartbeats = n;
            }
        }
        if let Ok(v) = std::env::var("ENGINE_MAX_CONCURRENT_HANDLERS") {
            if let Ok(n) = v.parse() {
                self.max_concurrent_handlers = n;
            }
        }
        if let Ok(v) = std::env::var("ENGINE_MAX_QUEUED_HANDLERS") {
            if let Ok(n) = v.parse() {
                self.max_queued_handlers = n;
            }
        }
        if let Ok(v) = std::env::var("ENGINE_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                self.max_connections = n;
            }
        }
    }

    /// Converts to the runtime representation.
    pub fn to_rpc_config(&self) -> RpcConfig {
        RpcConfig::default()
            .with_max_frame_size(self.max_frame_size)
            .with_handshake_timeout(Duration::from_millis(self.handshake_timeout_ms))
            .with_call_timeout(Duration::from_millis(self.call_timeout_ms))
            .with_heartbeat(
                Duration::from_millis(self.heartbeat_interval_ms),
                Duration::from_millis(self.pong_timeout_ms),
                self.missed_heartbeats,
            )
            .with_max_concurrent_handlers(self.max_concurrent_handlers)
            .with_max_queued_handlers(self.max_queued_handlers)
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    /// Delay before the first retry.
    pub base_ms: u64,
    /// Upper bound on any delay.
    pub cap_ms: u64,
    /// Fraction of the delay randomized in each direction (0.0 - 1.0).
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_ms: 200,
            cap_ms: 10_000,
            jitter: 0.5,
        }
    }
}

impl BackoffSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ENGINE_BACKOFF_BASE_MS") {
            if let Ok(ms) = v.parse() {
                self.base_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("ENGINE_BACKOFF_CAP_MS") {
            if let Ok(ms) = v.parse() {
                self.cap_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("ENGINE_BACKOFF_JITTER") {
            if let Ok(j) = v.parse() {
                self.jitter = j;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_ms == 0 {
            return Err(ConfigError::ValidationError(
                "backoff.base_ms must be at least 1".to_string(),
            ));
        }
        if self.cap_ms < self.base_ms {
            return Err(ConfigError::ValidationError(format!(
                "backoff.cap_ms ({}) must not be below backoff.base_ms ({})",
                self.cap_ms, self.base_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::ValidationError(format!(
                "backoff.jitter must be between 0 and 1, got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
