//! # engine-server
//!
//! Accepted side of the Engine API.
//!
//! This crate provides:
//! - Layered node configuration (defaults, YAML file, environment)
//! - Listeners over Unix sockets and TCP with per-endpoint peer checks
//! - A table of live sessions the node can call back into
//! - Connection limits, stats and graceful shutdown

pub mod config;
pub mod error;
pub mod server;

pub use config::{BackoffSettings, Config, ConfigError, NodeConfig, RpcSettings};
pub use error::ServerError;
pub use server::{BoundListener, Server, ServerConfig, ServerStats};
