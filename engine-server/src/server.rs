//! Listener and accepted-side connection handling.

use crate::config::Config;
use crate::error::ServerError;
use dashmap::DashMap;
use engine_core::{
    server_handshake, spawn_session, Endpoint, EndpointAddr, EngineListener, EngineStream,
    Handlers, Identity, RpcConfig, SessionHandle, TrafficCounters, TrafficSnapshot,
};
use engine_protocol::Compartment;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identity announced to accepted peers.
    pub identity: Identity,
    /// Endpoints to accept on. Each names the compartment allowed to connect.
    pub endpoints: Vec<Endpoint>,
    pub rpc: RpcConfig,
    /// Maximum concurrent connections across all endpoints.
    pub max_connections: usize,
    /// How long shutdown waits for sessions to drain before aborting them.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            endpoints: Vec::new(),
            rpc: RpcConfig::default(),
            max_connections: 1000,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Builds the server part of a node configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            identity: config.identity(),
            endpoints: config.listen.clone(),
            rpc: config.rpc.to_rpc_config(),
            max_connections: config.rpc.max_connections,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn with_rpc(mut self, rpc: RpcConfig) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub handshakes_failed: AtomicU64,
    /// Sessions that ended in failure rather than a clean close.
    pub errors_total: AtomicU64,
    traffic: Arc<TrafficCounters>,
}

impl ServerStats {
    /// Frame counters summed over every session this server has run.
    pub fn traffic(&self) -> TrafficSnapshot {
        self.traffic.snapshot()
    }
}

/// A listener bound to one configured endpoint.
#[derive(Debug)]
pub struct BoundListener {
    endpoint: Endpoint,
    listener: EngineListener,
}

impl BoundListener {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The address peers should dial, with the real port for `tcp:host:0`.
    pub fn local_addr(&self) -> std::io::Result<EndpointAddr> {
        self.listener.local_addr()
    }
}

struct Shared {
    config: ServerConfig,
    handlers: Arc<Handlers>,
    sessions: DashMap<String, SessionHandle>,
    stats: ServerStats,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

/// Engine API server.
///
/// Cheap to clone; clones share the session table and shutdown signal.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(config: ServerConfig, handlers: Handlers) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                handlers: Arc::new(handlers),
                sessions: DashMap::new(),
                stats: ServerStats::default(),
                shutdown,
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Binds every configured endpoint.
    pub async fn bind(&self) -> Result<Vec<BoundListener>, ServerError> {
        let endpoints = &self.shared.config.endpoints;
        if endpoints.is_empty() {
            return Err(ServerError::NoEndpoints);
        }

        let mut bound = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let listener =
                EngineListener::bind(&endpoint.addr)
                    .await
                    .map_err(|source| ServerError::Bind {
                        endpoint: endpoint.addr.clone(),
                        source,
                    })?;
            bound.push(BoundListener {
                endpoint: endpoint.clone(),
                listener,
            });
        }
        Ok(bound)
    }

    /// Binds and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Accepts on already-bound listeners until shutdown, then drains sessions.
    pub async fn serve(&self, listeners: Vec<BoundListener>) -> Result<(), ServerError> {
        if listeners.is_empty() {
            return Err(ServerError::NoEndpoints);
        }
        if *self.shared.shutdown.borrow() {
            return Err(ServerError::ShuttingDown);
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let mut loops = JoinSet::new();
        for bound in listeners {
            tracing::info!(
                "Listening on {} ({}) for {}",
                bound.local_addr().unwrap_or_else(|_| bound.endpoint.addr.clone()),
                bound.endpoint.name,
                bound.endpoint.peer
            );
            loops.spawn(accept_loop(self.shared.clone(), bound));
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                tracing::error!("Accept loop failed: {}", e);
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Signals shutdown: stop accepting and drain every session.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    /// Live sessions, in no particular order.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.shared
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn session(&self, id: &str) -> Option<SessionHandle> {
        self.shared.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Live sessions whose peer is `compartment`.
    pub fn sessions_for(&self, compartment: Compartment) -> Vec<SessionHandle> {
        self.shared
            .sessions
            .iter()
            .filter(|entry| entry.value().info().peer == compartment)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Sends a notification to every live session. Returns how many accepted it.
    pub async fn notify_all(&self, method: &str, params: Value) -> usize {
        let mut sent = 0;
        for session in self.sessions() {
            match session.notify(method, params.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!("[{}] Notify {} failed: {}", session.id(), method, e),
            }
        }
        sent
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.shared.config)
            .field("sessions", &self.shared.sessions.len())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn accept_loop(shared: Arc<Shared>, bound: BoundListener) {
    let BoundListener { endpoint, listener } = bound;
    let endpoint = Arc::new(endpoint);
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, label)) => {
                        while connections.try_join_next().is_some() {}

                        match admit(&shared) {
                            Ok(guard) => {
                                connections.spawn(handle_connection(
                                    guard,
                                    endpoint.clone(),
                                    stream,
                                    label,
                                ));
                            }
                            Err(e) => tracing::warn!("Rejecting {}: {}", label, e),
                        }
                    }
                    Err(e) => {
                        tracing::error!("Accept error on {}: {}", endpoint.name, e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
            _ = stopped(&mut shutdown_rx) => {
                tracing::info!("Closing listener {}", endpoint.name);
                break;
            }
        }
    }

    // Removes the Unix socket file before sessions finish draining.
    drop(listener);

    let grace = shared.config.shutdown_grace;
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            "{} session(s) on {} still open after {:?}, aborting",
            connections.len(),
            endpoint.name,
            grace
        );
        connections.shutdown().await;
    }
}

/// Resolves once shutdown has been requested.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Takes a slot of the connection limit for a freshly accepted stream.
fn admit(shared: &Arc<Shared>) -> Result<ActiveGuard, ServerError> {
    let max = shared.config.max_connections;
    let active = shared.stats.connections_active.load(Ordering::Relaxed);
    if active as usize >= max {
        shared.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
        return Err(ServerError::ConnectionLimit(max));
    }

    shared.stats.connections_total.fetch_add(1, Ordering::Relaxed);
    shared.stats.connections_active.fetch_add(1, Ordering::Relaxed);
    Ok(ActiveGuard(shared.clone()))
}

/// Holds one slot of the connection limit.
struct ActiveGuard(Arc<Shared>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0
            .stats
            .connections_active
            .fetch_sub(1, Ordering::Relaxed);
    }
}

async fn handle_connection(
    guard: ActiveGuard,
    endpoint: Arc<Endpoint>,
    mut stream: EngineStream,
    label: String,
) {
    let shared = guard.0.clone();
    let config = &shared.config;

    let negotiated = match server_handshake(&mut stream, &config.identity, &endpoint, &config.rpc)
        .await
        .map_err(ServerError::from)
    {
        Ok(negotiated) => negotiated,
        Err(e) => {
            shared.stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "[{}] {} on {} (code {})",
                label,
                e,
                endpoint.name,
                e.error_code().as_i32()
            );
            return;
        }
    };

    let (handle, mut driver) = spawn_session(
        stream,
        negotiated,
        &config.rpc,
        shared.handlers.clone(),
        shared.stats.traffic.clone(),
    );
    let id = handle.id().to_string();
    tracing::info!(
        "[{}] {} connected on {} ({}) format={}",
        id,
        handle.info().peer,
        endpoint.name,
        label,
        handle.info().wire_format
    );
    shared.sessions.insert(id.clone(), handle.clone());

    let mut shutdown_rx = shared.shutdown.subscribe();
    let outcome = tokio::select! {
        outcome = &mut driver => outcome,
        _ = stopped(&mut shutdown_rx) => {
            handle.close();
            driver.await
        }
    };

    shared.sessions.remove(&id);
    match outcome {
        Ok(reason) => {
            if reason.is_failure() {
                shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }
            tracing::info!("[{}] Client disconnected: {}", id, reason);
        }
        Err(e) => {
            shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::error!("[{}] Session task failed: {}", id, e);
        }
    }
    drop(guard);
}
