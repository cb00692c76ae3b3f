//! Connection management.
//!
//! A [`ConnectionManager`] owns the dialing side of one endpoint. A single
//! supervisor task walks the connection through its states, replacing the
//! session with a fresh one after every loss until the manager is closed.

use crate::backoff::BackoffConfig;
use crate::error::ClientError;
use engine_core::{
    client_handshake, spawn_session, CallError, CloseReason, ConnectionState, Endpoint, Handlers,
    Identity, RpcConfig, SessionHandle, TrafficCounters, TrafficSnapshot,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Where to dial and which compartment must answer.
    pub endpoint: Endpoint,
    /// Identity announced in the handshake.
    pub identity: Identity,
    pub rpc: RpcConfig,
    pub backoff: BackoffConfig,
    /// Transport connect timeout, separate from the handshake deadline.
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(endpoint: Endpoint, identity: Identity) -> Self {
        Self {
            endpoint,
            identity,
            rpc: RpcConfig::default(),
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_rpc(mut self, rpc: RpcConfig) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Counters for one manager.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Handshakes that reached Live.
    pub connects: AtomicU64,
    /// Connect or handshake attempts that failed.
    pub failures: AtomicU64,
    /// Live sessions that were lost.
    pub disconnects: AtomicU64,
}

struct Shared {
    config: ConnectionConfig,
    handlers: Arc<Handlers>,
    state: watch::Sender<ConnectionState>,
    session: watch::Sender<Option<SessionHandle>>,
    reconnect: Notify,
    shutdown: watch::Sender<bool>,
    stats: ConnectionStats,
    traffic: Arc<TrafficCounters>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(
                "[{}] Connection state {} -> {}",
                self.config.endpoint.name,
                previous,
                state
            );
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Keeps one endpoint connected.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Starts dialing immediately. `handlers` serve calls the peer makes to us.
    pub fn start(config: ConnectionConfig, handlers: Handlers) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (session, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            handlers: Arc::new(handlers),
            state,
            session,
            reconnect: Notify::new(),
            shutdown,
            stats: ConnectionStats::default(),
            traffic: Arc::new(TrafficCounters::default()),
        });

        let task = tokio::spawn(supervise(shared.clone()));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The current session, if one is live.
    pub fn session(&self) -> Option<SessionHandle> {
        self.shared
            .session
            .borrow()
            .as_ref()
            .filter(|session| session.is_live())
            .cloned()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.shared.stats
    }

    /// Frame counters summed over every session this manager has run.
    pub fn traffic(&self) -> TrafficSnapshot {
        self.shared.traffic.snapshot()
    }

    /// Waits up to `timeout` for a live session.
    pub async fn wait_live(&self, timeout: Duration) -> Result<SessionHandle, CallError> {
        let mut sessions = self.shared.session.subscribe();
        let mut state = self.shared.state.subscribe();

        let wait = async {
            loop {
                if let Some(session) = sessions.borrow_and_update().as_ref() {
                    if session.is_live() {
                        return Ok(session.clone());
                    }
                }
                if *state.borrow_and_update() == ConnectionState::Closed {
                    return Err(CallError::ConnectionLost(format!(
                        "connection to {} is closed",
                        self.shared.config.endpoint.name
                    )));
                }
                tokio::select! {
                    _ = sessions.changed() => {}
                    _ = state.changed() => {}
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| CallError::Timeout(timeout))?
    }

    /// Drops the current session, if any, and dials again without waiting
    /// out the backoff. Requests made while one is pending coalesce.
    pub fn reconnect(&self) {
        if let Some(session) = self.shared.session.borrow().as_ref() {
            session.close();
        }
        self.shared.reconnect.notify_one();
    }

    /// Closes the connection for good. Outstanding calls fail with
    /// `ConnectionLost`; the manager never reconnects afterwards.
    pub async fn close(&self) {
        self.shared.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(
                    "[{}] Connection supervisor failed: {}",
                    self.shared.config.endpoint.name,
                    e
                );
            }
        }
        self.shared.set_state(ConnectionState::Closed);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.shared.config.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

/// What the supervisor does next.
enum Step {
    Dial,
    Run {
        session: SessionHandle,
        driver: JoinHandle<CloseReason>,
    },
    Wait {
        delay: Duration,
    },
    Stop,
}

async fn supervise(shared: Arc<Shared>) {
    let name = shared.config.endpoint.name.clone();
    let mut shutdown = shared.shutdown.subscribe();
    let mut attempt: u32 = 0;
    let mut step = Step::Dial;

    loop {
        step = match step {
            Step::Dial => {
                shared.set_state(ConnectionState::Connecting);
                let dialed = tokio::select! {
                    dialed = dial(&shared) => Some(dialed),
                    _ = stopped(&mut shutdown) => None,
                };
                match dialed {
                    None => Step::Stop,
                    Some(Ok((session, driver))) => {
                        attempt = 0;
                        shared.stats.connects.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            "[{}] Connected to {} at {} session={} format={}",
                            name,
                            session.info().peer,
                            shared.config.endpoint.addr,
                            session.id(),
                            session.info().wire_format
                        );
                        // This session already answers any reconnect asked
                        // for while dialing.
                        if take_reconnect_request(&shared.reconnect).await {
                            tracing::debug!("[{}] Reconnect satisfied by new session", name);
                        }
                        shared.session.send_replace(Some(session.clone()));
                        shared.set_state(ConnectionState::Live);
                        Step::Run { session, driver }
                    }
                    Some(Err(e)) => {
                        shared.stats.failures.fetch_add(1, Ordering::Relaxed);
                        shared.set_state(ConnectionState::Disconnected);
                        let delay = shared.config.backoff.delay(attempt);
                        tracing::warn!(
                            "[{}] Connect to {} failed (attempt {}): {}; retrying in {:?}",
                            name,
                            shared.config.endpoint.addr,
                            attempt + 1,
                            e,
                            delay
                        );
                        attempt = attempt.saturating_add(1);
                        Step::Wait { delay }
                    }
                }
            }

            Step::Run {
                session,
                mut driver,
            } => {
                let outcome = tokio::select! {
                    outcome = &mut driver => outcome,
                    _ = stopped(&mut shutdown) => {
                        session.close();
                        driver.await
                    }
                };
                // The driver has already failed every outstanding call.
                shared.session.send_replace(None);
                shared.set_state(ConnectionState::Disconnected);

                match outcome {
                    Ok(reason) if reason.is_failure() => {
                        shared.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("[{}] Connection lost: {}", name, reason);
                    }
                    Ok(reason) => tracing::info!("[{}] Connection closed: {}", name, reason),
                    Err(e) => {
                        shared.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                        tracing::error!("[{}] Session task failed: {}", name, e);
                    }
                }

                if shared.is_shutting_down() {
                    Step::Stop
                } else {
                    Step::Wait {
                        delay: shared.config.backoff.delay(attempt),
                    }
                }
            }

            Step::Wait { delay } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Step::Dial,
                    _ = shared.reconnect.notified() => {
                        tracing::debug!("[{}] Reconnect requested", name);
                        Step::Dial
                    }
                    _ = stopped(&mut shutdown) => Step::Stop,
                }
            }

            Step::Stop => break,
        };
    }

    shared.session.send_replace(None);
    shared.set_state(ConnectionState::Closed);
    tracing::info!("[{}] Connection manager stopped", name);
}

/// Consumes a pending reconnect request without waiting for one.
async fn take_reconnect_request(reconnect: &Notify) -> bool {
    tokio::select! {
        biased;
        _ = reconnect.notified() => true,
        _ = std::future::ready(()) => false,
    }
}

/// Resolves once shutdown has been requested.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn dial(shared: &Shared) -> Result<(SessionHandle, JoinHandle<CloseReason>), ClientError> {
    let config = &shared.config;
    let mut stream = tokio::time::timeout(config.connect_timeout, config.endpoint.addr.connect())
        .await
        .map_err(|_| ClientError::ConnectTimeout(config.connect_timeout))??;

    shared.set_state(ConnectionState::Handshaking);
    let negotiated =
        client_handshake(&mut stream, &config.identity, &config.endpoint, &config.rpc).await?;

    Ok(spawn_session(
        stream,
        negotiated,
        &config.rpc,
        shared.handlers.clone(),
        shared.traffic.clone(),
    ))
}
