//! A live connection after a successful handshake.
//!
//! One task owns the read half, the decoder, the dispatcher and the liveness
//! monitor's result; a second task owns the write half. Everything that can
//! end the connection (EOF, I/O error, bad frame, dead peer, local close)
//! funnels into a single [`CloseReason`], and every outstanding call is
//! failed before the session reports `Closed`.

use crate::config::RpcConfig;
use crate::dispatcher::{Dispatcher, Handlers};
use crate::error::CallError;
use crate::handshake::{Negotiated, SessionInfo};
use crate::liveness::{ActivityTracker, LivenessMonitor, LivenessOutcome};
use crate::registry::{PendingCall, PendingCalls};
use crate::writer::{spawn_writer, Outbound, WriterShutdown};
use engine_protocol::message::{
    CancelParams, PingParams, CANCEL_METHOD, HELLO_METHOD, PING_METHOD, PONG_METHOD,
};
use engine_protocol::{
    Decoder, Encoder, ErrorCode, ErrorResponse, Message, Notification, RpcError,
};
use serde_json::Value;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// How long a closing session waits for queued frames to reach the socket.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Live,
    Draining,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Handshaking => write!(f, "handshaking"),
            ConnectionState::Live => write!(f, "live"),
            ConnectionState::Draining => write!(f, "draining"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its end of the stream.
    PeerClosed,
    Io(String),
    Framing(String),
    Protocol(String),
    /// The liveness monitor gave up on the peer.
    LivenessTimeout { missed: u32 },
    /// [`SessionHandle::close`] was called.
    Shutdown,
}

impl CloseReason {
    /// Returns whether the session ended because something went wrong.
    pub fn is_failure(&self) -> bool {
        !matches!(self, CloseReason::Shutdown)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed the connection"),
            CloseReason::Io(e) => write!(f, "I/O error: {}", e),
            CloseReason::Framing(e) => write!(f, "framing error: {}", e),
            CloseReason::Protocol(e) => write!(f, "protocol error: {}", e),
            CloseReason::LivenessTimeout { missed } => {
                write!(f, "peer missed {} heartbeats", missed)
            }
            CloseReason::Shutdown => write!(f, "closed locally"),
        }
    }
}

/// Inbound traffic counters. May be shared by many sessions.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    pub frames_received: AtomicU64,
    pub requests_received: AtomicU64,
    pub notifications_received: AtomicU64,
    pub responses_received: AtomicU64,
    /// Responses that arrived for an id nobody was waiting on.
    pub late_responses: AtomicU64,
}

impl TrafficCounters {
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            notifications_received: self.notifications_received.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TrafficCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub frames_received: u64,
    pub requests_received: u64,
    pub notifications_received: u64,
    pub responses_received: u64,
    pub late_responses: u64,
}

/// Cloneable handle for issuing calls over a live session.
#[derive(Clone)]
pub struct SessionHandle {
    info: Arc<SessionInfo>,
    registry: PendingCalls,
    outbound: Outbound,
    state: watch::Receiver<ConnectionState>,
    close: Arc<Notify>,
}

impl SessionHandle {
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == ConnectionState::Live
    }

    /// Calls `method` with the default deadline and waits for the result.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        self.start_call(method, params, None).await?.result().await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        self.start_call(method, params, Some(timeout))
            .await?
            .result()
            .await
    }

    /// Starts a call whose partial results the caller wants to see.
    pub async fn call_streaming(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<PendingCall, CallError> {
        self.start_call(method, params, timeout).await
    }

    async fn start_call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<PendingCall, CallError> {
        let state = self.state();
        if state != ConnectionState::Live {
            return Err(CallError::ConnectionLost(format!("session is {}", state)));
        }

        let (request, pending) = self.registry.issue(method, params, timeout)?;
        // On failure `pending` is dropped, which frees the registry slot.
        self.outbound.send(&request.into()).await?;
        Ok(pending.with_cancel_notice(self.outbound.clone()))
    }

    /// Sends a notification. Nothing comes back.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), CallError> {
        let state = self.state();
        if state != ConnectionState::Live {
            return Err(CallError::ConnectionLost(format!("session is {}", state)));
        }
        self.outbound
            .send(&Notification::new(method, params).into())
            .await
    }

    /// Number of calls from this side still awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.registry.len()
    }

    /// Asks the session to drain and close. Returns immediately.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Waits until the session has fully closed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.info.id)
            .field("peer", &self.info.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Starts the tasks driving a freshly negotiated connection.
///
/// Returns a handle for issuing calls and the driver task, which resolves to
/// the reason the session ended.
pub fn spawn_session<T>(
    transport: T,
    negotiated: Negotiated,
    config: &RpcConfig,
    handlers: Arc<Handlers>,
    counters: Arc<TrafficCounters>,
) -> (SessionHandle, JoinHandle<CloseReason>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let Negotiated { info, decoder } = negotiated;
    let (reader, writer) = tokio::io::split(transport);

    let encoder = Encoder::new(info.wire_format, config.max_frame_size);
    let (outbound, writer_shutdown, writer_task) =
        spawn_writer(writer, encoder, config.write_queue_capacity);

    let registry = PendingCalls::new(config.call_timeout);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Live);
    let close = Arc::new(Notify::new());
    let tracker = ActivityTracker::new();

    let dispatcher = Dispatcher::new(
        handlers,
        config.max_concurrent_handlers,
        info.peer,
        &info.id,
    )
    .with_queue_limit(config.max_queued_handlers);

    tracing::info!(
        "[{}] Session live with {} (format={}, capabilities={:?})",
        info.id,
        info.peer,
        info.wire_format,
        info.capabilities
    );

    let info = Arc::new(info);
    let handle = SessionHandle {
        info: info.clone(),
        registry: registry.clone(),
        outbound: outbound.clone(),
        state: state_rx,
        close: close.clone(),
    };

    let driver = Driver {
        reader,
        decoder,
        dispatcher,
        registry,
        outbound,
        tracker,
        counters,
        state: state_tx,
        info,
        read_buffer_size: config.read_buffer_size,
    };
    let monitor = LivenessMonitor::new(config, driver.tracker.clone());
    let task = tokio::spawn(driver.run(monitor, writer_task, writer_shutdown, close));

    (handle, task)
}

struct Driver<T> {
    reader: ReadHalf<T>,
    decoder: Decoder,
    dispatcher: Dispatcher,
    registry: PendingCalls,
    outbound: Outbound,
    tracker: ActivityTracker,
    counters: Arc<TrafficCounters>,
    state: watch::Sender<ConnectionState>,
    info: Arc<SessionInfo>,
    read_buffer_size: usize,
}

impl<T> Driver<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(
        mut self,
        monitor: LivenessMonitor,
        mut writer_task: JoinHandle<io::Result<()>>,
        writer_shutdown: WriterShutdown,
        close: Arc<Notify>,
    ) -> CloseReason {
        let mut liveness = tokio::spawn(monitor.run(self.outbound.clone()));
        let mut buf = vec![0u8; self.read_buffer_size];
        let mut writer_finished = false;

        let reason = loop {
            // Frames may already be buffered, including ones that arrived
            // together with the handshake reply.
            if let Err(reason) = self.drain_decoder() {
                break reason;
            }

            tokio::select! {
                result = self.reader.read(&mut buf) => match result {
                    Ok(0) => break CloseReason::PeerClosed,
                    Ok(n) => {
                        self.tracker.observe();
                        self.decoder.extend(&buf[..n]);
                    }
                    Err(e) => break CloseReason::Io(e.to_string()),
                },

                outcome = &mut liveness => {
                    break match outcome {
                        Ok(LivenessOutcome::Dead { missed }) => {
                            CloseReason::LivenessTimeout { missed }
                        }
                        Ok(LivenessOutcome::WriterClosed) => {
                            CloseReason::Io("writer closed".to_string())
                        }
                        Err(e) => CloseReason::Io(format!("liveness monitor failed: {}", e)),
                    };
                }

                result = &mut writer_task => {
                    writer_finished = true;
                    break match result {
                        Ok(Ok(())) => CloseReason::Io("writer stopped".to_string()),
                        Ok(Err(e)) => CloseReason::Io(e.to_string()),
                        Err(e) => CloseReason::Io(format!("writer task failed: {}", e)),
                    };
                }

                _ = close.notified() => break CloseReason::Shutdown,
            }
        };

        let session_id = self.info.id.clone();
        let _ = self.state.send(ConnectionState::Draining);
        liveness.abort();

        let failed = self
            .registry
            .fail_all(CallError::ConnectionLost(reason.to_string()));
        if failed > 0 {
            tracing::debug!("[{}] Failed {} outstanding calls", session_id, failed);
        }
        self.dispatcher.abort_all();

        // Let queued frames (error replies, pongs) reach the socket.
        writer_shutdown.shutdown();
        if !writer_finished {
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut writer_task).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::debug!("[{}] Writer did not drain in time", session_id);
                    writer_task.abort();
                }
            }
        }

        if reason.is_failure() {
            tracing::warn!("[{}] Session with {} lost: {}", session_id, self.info.peer, reason);
        } else {
            tracing::info!("[{}] Session with {} closed", session_id, self.info.peer);
        }
        let _ = self.state.send(ConnectionState::Closed);
        reason
    }

    fn drain_decoder(&mut self) -> Result<(), CloseReason> {
        loop {
            let message = match self.decoder.decode() {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(e) if e.is_framing() => return Err(CloseReason::Framing(e.to_string())),
                Err(e) => return Err(CloseReason::Protocol(e.to_string())),
            };
            self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
            self.route(message);
        }
    }

    fn route(&mut self, message: Message) {
        tracing::trace!("[{}] <- {:?}", self.info.id, message);

        match message {
            Message::Notification(n) if n.method == PING_METHOD => {
                let seq = serde_json::from_value::<PingParams>(n.params)
                    .map(|p| p.seq)
                    .unwrap_or(0);
                if let Err(e) = self.outbound.try_send(&Notification::pong(seq).into()) {
                    tracing::debug!("[{}] Could not queue pong: {}", self.info.id, e);
                }
            }
            Message::Notification(n) if n.method == PONG_METHOD => {
                tracing::trace!("[{}] Pong received", self.info.id);
            }
            Message::Notification(n) if n.method == CANCEL_METHOD => {
                match serde_json::from_value::<CancelParams>(n.params) {
                    Ok(params) => {
                        if self.dispatcher.cancel(params.id) {
                            tracing::debug!("[{}] Cancelled call id={}", self.info.id, params.id);
                        }
                    }
                    Err(e) => tracing::debug!("[{}] Bad cancel params: {}", self.info.id, e),
                }
            }
            Message::Request(request) if request.method == HELLO_METHOD => {
                let reply = ErrorResponse::new(
                    request.id,
                    RpcError::new(ErrorCode::InvalidRequest, "session already established"),
                );
                let _ = self.outbound.try_send(&reply.into());
            }
            message @ Message::Request(_) => {
                self.counters.requests_received.fetch_add(1, Ordering::Relaxed);
                self.dispatcher.dispatch(message, &self.outbound);
            }
            message @ Message::Notification(_) => {
                self.counters
                    .notifications_received
                    .fetch_add(1, Ordering::Relaxed);
                self.dispatcher.dispatch(message, &self.outbound);
            }
            message @ (Message::Response(_) | Message::Error(_)) => {
                self.counters
                    .responses_received
                    .fetch_add(1, Ordering::Relaxed);
                if !self.registry.resolve(message) {
                    self.counters.late_responses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}
