//! High-level client API.

use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionStats};
use crate::error::ClientError;
use engine_core::{
    CallError, ConnectionState, Handlers, PendingCall, SessionHandle, SessionInfo, TrafficSnapshot,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// High-level client for one Engine API endpoint.
///
/// Calls made while the connection is down wait for it to come back, within
/// the call's own deadline. Calls in flight when it drops fail with
/// `ConnectionLost` and are never replayed.
#[derive(Clone)]
pub struct Client {
    manager: Arc<ConnectionManager>,
    default_timeout: Duration,
}

impl Client {
    /// Starts connecting. The client serves no methods of its own.
    pub fn connect(config: ConnectionConfig) -> Self {
        Self::with_handlers(config, Handlers::new())
    }

    /// Starts connecting; `handlers` serve calls the peer makes to us.
    pub fn with_handlers(config: ConnectionConfig, handlers: Handlers) -> Self {
        let default_timeout = config.rpc.call_timeout;
        Self {
            manager: Arc::new(ConnectionManager::start(config, handlers)),
            default_timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Watches connection state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe()
    }

    pub fn is_live(&self) -> bool {
        self.manager.session().is_some()
    }

    /// Waits for a live connection and returns what was negotiated.
    pub async fn wait_live(&self, timeout: Duration) -> Result<SessionInfo, ClientError> {
        match self.manager.wait_live(timeout).await {
            Ok(session) => Ok(session.info().clone()),
            Err(e) => Err(self.closed_or(e)),
        }
    }

    /// Calls `method` with the default deadline.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        self.call_with_timeout(method, params, self.default_timeout)
            .await
    }

    /// Calls `method`. The deadline covers waiting for a connection as well
    /// as the call itself.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let (session, remaining) = self.live_session(timeout).await?;
        session
            .call_with_timeout(method, params, remaining)
            .await
            .map_err(|e| match e {
                CallError::Timeout(_) => CallError::Timeout(timeout),
                other => other,
            })
    }

    /// Calls `method` with typed params and result.
    pub async fn call_as<P, R>(&self, method: &str, params: &P) -> Result<R, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self
            .call(method, params)
            .await
            .map_err(|e| self.closed_or(e))?;
        Ok(serde_json::from_value(result)?)
    }

    /// Reports a failure on a closed client as [`ClientError::Closed`].
    fn closed_or(&self, error: CallError) -> ClientError {
        match error {
            CallError::ConnectionLost(_) if self.state() == ConnectionState::Closed => {
                ClientError::Closed
            }
            other => ClientError::Call(other),
        }
    }

    /// Starts a call whose partial results the caller wants to see.
    pub async fn call_streaming(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<PendingCall, CallError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (session, remaining) = self.live_session(timeout).await?;
        session.call_streaming(method, params, Some(remaining)).await
    }

    /// Sends a notification, waiting up to the default deadline for a connection.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), CallError> {
        let (session, _) = self.live_session(self.default_timeout).await?;
        session.notify(method, params).await
    }

    async fn live_session(&self, timeout: Duration) -> Result<(SessionHandle, Duration), CallError> {
        let started = Instant::now();
        let session = self.manager.wait_live(timeout).await?;
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(CallError::Timeout(timeout));
        }
        Ok((session, remaining))
    }

    /// Drops the current connection and dials again right away.
    pub fn reconnect(&self) {
        self.manager.reconnect();
    }

    /// Closes the client for good.
    pub async fn close(&self) {
        self.manager.close().await;
    }

    pub fn connection_stats(&self) -> &ConnectionStats {
        self.manager.stats()
    }

    pub fn traffic(&self) -> TrafficSnapshot {
        self.manager.traffic()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("manager", &self.manager)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
