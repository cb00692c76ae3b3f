//! # engine-client
//!
//! Dialing side of the Engine API.
//!
//! This crate provides:
//! - A connection manager that reconnects with capped, jittered backoff
//! - The client half of the `engine.hello` handshake on every reconnect
//! - A high-level client whose calls wait out transient disconnects
//! - A relay handler forwarding calls to another compartment

pub mod backoff;
pub mod client;
pub mod connection;
pub mod error;
pub mod relay;

pub use backoff::BackoffConfig;
pub use client::Client;
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionStats};
pub use error::ClientError;
pub use relay::Relay;
