//! Method routing for inbound requests and notifications.
//!
//! [`Handlers`] is the method table, built once and shared by every
//! connection. [`Dispatcher`] is the per-connection side: it runs handlers
//! concurrently under a worker limit, tracks them for cancellation, and
//! writes each request's outcome back on the same connection.

use crate::error::{CallError, HandlerError};
use crate::writer::Outbound;
use engine_protocol::message::RESERVED_PREFIX;
use engine_protocol::{
    Compartment, ErrorResponse, Message, Notification, Request, RequestId, Response, RpcError,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinSet};

/// Outcome of a handler invocation.
pub type HandlerResult = Result<Value, HandlerError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A method implementation.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, params: Value, ctx: CallContext) -> BoxFuture<'static, HandlerResult>;
}

/// Adapts a closure over typed params and result.
///
/// Params that do not deserialize into `T` are answered with an
/// invalid-params error without running the closure.
pub struct TypedHandler<F, T, R, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    fn call(&self, params: Value, ctx: CallContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match serde_json::from_value(params) {
            Ok(v) => v,
            Err(e) => {
                return Box::pin(async move { Err(HandlerError::InvalidParams(e.to_string())) })
            }
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let result = fut.await?;
            Ok(serde_json::to_value(result)?)
        })
    }
}

/// Method table mapping names to handlers.
#[derive(Default, Clone)]
pub struct Handlers {
    methods: HashMap<String, Arc<dyn Handler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `method`, replacing any previous one.
    ///
    /// Names starting with `engine.` belong to the protocol and are refused.
    pub fn register<H: Handler>(&mut self, method: &str, handler: H) -> &mut Self {
        if method.starts_with(RESERVED_PREFIX) || method.is_empty() {
            tracing::warn!("Refusing to register reserved method name '{}'", method);
            return self;
        }
        self.methods.insert(method.to_string(), Arc::new(handler));
        self
    }

    /// Registers a closure taking deserialized params.
    pub fn register_fn<F, T, R, Fut>(&mut self, method: &str, handler: F) -> &mut Self
    where
        F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        self.register(method, TypedHandler::new(handler))
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.methods.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// What a handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct CallContext {
    id: Option<RequestId>,
    method: Arc<str>,
    peer: Compartment,
    session_id: Arc<str>,
    outbound: Outbound,
}

impl CallContext {
    /// The request id, or `None` for a notification.
    pub fn id(&self) -> Option<RequestId> {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Compartment on the other end of the connection.
    pub fn peer(&self) -> Compartment {
        self.peer
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Sends a partial result ahead of the handler's final value.
    pub async fn partial<T: Serialize>(&self, value: &T) -> Result<(), HandlerError> {
        let Some(id) = self.id else {
            return Err(HandlerError::Internal(
                "notifications have no reply path".to_string(),
            ));
        };
        let value = serde_json::to_value(value)?;
        self.outbound
            .send(&Response::partial(id, value).into())
            .await
            .map_err(|e| HandlerError::Internal(e.to_string()))
    }
}

/// Handlers that may wait for a worker slot when none is set explicitly.
const DEFAULT_QUEUE_LIMIT: usize = 1024;

/// Per-connection handler runner.
pub struct Dispatcher {
    handlers: Arc<Handlers>,
    permits: Arc<Semaphore>,
    /// Slots for running plus waiting handlers.
    backlog: Arc<Semaphore>,
    inflight: Arc<Mutex<HashMap<RequestId, AbortHandle>>>,
    tasks: JoinSet<()>,
    peer: Compartment,
    session_id: Arc<str>,
}

impl Dispatcher {
    pub fn new(
        handlers: Arc<Handlers>,
        max_concurrent: usize,
        peer: Compartment,
        session_id: &str,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            handlers,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            backlog: Arc::new(Semaphore::new(max_concurrent + DEFAULT_QUEUE_LIMIT)),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            tasks: JoinSet::new(),
            peer,
            session_id: Arc::from(session_id),
        }
    }

    /// Caps how many handlers may wait for a worker slot. Requests beyond
    /// that are refused with an internal error; notifications are dropped.
    pub fn with_queue_limit(mut self, queued: usize) -> Self {
        let workers = self.permits.available_permits();
        self.backlog = Arc::new(Semaphore::new(workers + queued));
        self
    }

    /// Starts handling an inbound request or notification. Never blocks the
    /// caller; handlers beyond the worker limit wait for a free slot, up to
    /// the queue limit.
    pub fn dispatch(&mut self, message: Message, outbound: &Outbound) {
        while self.tasks.try_join_next().is_some() {}

        match message {
            Message::Request(request) => self.dispatch_request(request, outbound.clone()),
            Message::Notification(notification) => {
                self.dispatch_notification(notification, outbound.clone())
            }
            other => {
                tracing::warn!("Dispatcher ignoring non-inbound message: {:?}", other);
            }
        }
    }

    fn context(&self, id: Option<RequestId>, method: &str, outbound: Outbound) -> CallContext {
        CallContext {
            id,
            method: Arc::from(method),
            peer: self.peer,
            session_id: self.session_id.clone(),
            outbound,
        }
    }

    fn admit(&self) -> Option<OwnedSemaphorePermit> {
        self.backlog.clone().try_acquire_owned().ok()
    }

    fn dispatch_request(&mut self, request: Request, outbound: Outbound) {
        let id = request.id;
        let Some(slot) = self.admit() else {
            tracing::warn!(
                "[{}] Refusing {} id={}: handler queue full",
                self.session_id,
                request.method,
                id
            );
            let reply = ErrorResponse::new(id, RpcError::internal("too many requests in flight"));
            if let Err(e) = outbound.try_send(&reply.into()) {
                tracing::debug!("[{}] Could not queue refusal: {}", self.session_id, e);
            }
            return;
        };

        let Some(handler) = self.handlers.get(&request.method) else {
            tracing::debug!("[{}] Method not found: {}", self.session_id, request.method);
            let reply = ErrorResponse::new(id, RpcError::method_not_found(&request.method));
            self.tasks.spawn(async move {
                let _slot = slot;
                let _ = outbound.send(&reply.into()).await;
            });
            return;
        };

        let ctx = self.context(Some(id), &request.method, outbound.clone());
        let permits = self.permits.clone();
        let inflight = self.inflight.clone();
        let method = request.method;
        let params = request.params;

        self.tasks.spawn(async move {
            let _slot = slot;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            let task = tokio::spawn(handler.call(params, ctx));
            inflight.lock().insert(id, task.abort_handle());
            let outcome = task.await;
            inflight.lock().remove(&id);

            let reply: Message = match outcome {
                Ok(Ok(result)) => Response::ok(id, result).into(),
                Ok(Err(err)) => {
                    tracing::debug!("Handler {} failed for call id={}: {}", method, id, err);
                    ErrorResponse::new(id, err.to_rpc_error()).into()
                }
                Err(e) if e.is_cancelled() => {
                    tracing::debug!("Handler {} cancelled for call id={}", method, id);
                    return;
                }
                Err(e) => {
                    tracing::error!("Handler {} panicked for call id={}: {}", method, id, e);
                    ErrorResponse::new(id, RpcError::internal("handler panicked")).into()
                }
            };

            if let Err(CallError::Framing(reason)) = outbound.send(&reply).await {
                tracing::warn!("Result of {} id={} not sendable: {}", method, id, reason);
                let fallback = ErrorResponse::new(
                    id,
                    RpcError::internal(format!("result could not be encoded: {}", reason)),
                );
                let _ = outbound.send(&fallback.into()).await;
            }
        });
    }

    fn dispatch_notification(&mut self, notification: Notification, outbound: Outbound) {
        let Some(handler) = self.handlers.get(&notification.method) else {
            tracing::debug!(
                "[{}] No handler for notification {}",
                self.session_id,
                notification.method
            );
            return;
        };
        let Some(slot) = self.admit() else {
            tracing::warn!(
                "[{}] Dropping notification {}: handler queue full",
                self.session_id,
                notification.method
            );
            return;
        };

        let ctx = self.context(None, &notification.method, outbound);
        let permits = self.permits.clone();
        let method = notification.method;
        let params = notification.params;

        self.tasks.spawn(async move {
            let _slot = slot;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match tokio::spawn(handler.call(params, ctx)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::warn!("Notification handler {} failed: {}", method, err),
                Err(e) => tracing::error!("Notification handler {} panicked: {}", method, e),
            }
        });
    }

    /// Aborts the handler serving request `id`, if it is still running.
    ///
    /// No response is sent for an aborted request.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.inflight.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of request handlers currently executing.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Aborts every running and queued handler.
    pub fn abort_all(&mut self) {
        self.tasks.abort_all();
        for (_, handle) in self.inflight.lock().drain() {
            handle.abort();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{spawn_writer, WriterShutdown};
    use engine_protocol::{Decoder, Encoder, ErrorCode, WireFormat};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct Peer {
        reader: DuplexStream,
        decoder: Decoder,
        outbound: Outbound,
        _shutdown: WriterShutdown,
    }

    impl Peer {
        fn new() -> Self {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            let encoder = Encoder::new(WireFormat::MsgPack, 64 * 1024);
            let (outbound, shutdown, _task) = spawn_writer(ours, encoder, 64);
            Self {
                reader: theirs,
                decoder: Decoder::new(WireFormat::MsgPack, 64 * 1024),
                outbound,
                _shutdown: shutdown,
            }
        }

        async fn next(&mut self) -> Message {
            loop {
                if let Some(msg) = self.decoder.decode().unwrap() {
                    return msg;
                }
                let mut buf = [0u8; 4096];
                let n = self.reader.read(&mut buf).await.unwrap();
                assert!(n > 0, "writer closed");
                self.decoder.extend(&buf[..n]);
            }
        }
    }

    #[derive(Deserialize)]
    struct GenerateParams {
        prompt: String,
    }

    fn handlers() -> Arc<Handlers> {
        let mut handlers = Handlers::new();
        handlers
            .register_fn("ping", |_: Value, _ctx| async move {
                Ok::<_, HandlerError>(json!({"pong": true}))
            })
            .register_fn("generate", |params: GenerateParams, ctx: CallContext| async move {
                for word in params.prompt.split(' ') {
                    ctx.partial(&word).await?;
                }
                Ok::<_, HandlerError>(json!({"done": true}))
            })
            .register_fn("quota", |_: Value, _ctx| async move {
                Err::<Value, _>(HandlerError::application(4001, "quota exceeded"))
            })
            .register_fn("boom", |_: Value, _ctx| async move {
                if true {
                    panic!("handler exploded");
                }
                Ok::<_, HandlerError>(Value::Null)
            })
            .register_fn("sleep", |_: Value, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, HandlerError>(Value::Null)
            });
        Arc::new(handlers)
    }

    fn dispatcher(limit: usize) -> Dispatcher {
        Dispatcher::new(handlers(), limit, Compartment::Network, "test-session")
    }

    #[tokio::test]
    async fn test_request_gets_response() {
        let mut peer = Peer::new();
        let mut dispatcher = dispatcher(4);

        dispatcher.dispatch(Request::new(1, "ping").into(), &peer.outbound);
        assert_eq!(
            peer.next().await,
            Message::from(Response::ok(1, json!({"pong": true})))
        );
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let mut peer = Peer::new();
        let mut dispatcher = dispatcher(4);

        dispatcher.dispatch(Request::new(2, "missing").into(), &peer.outbound);
        match peer.next().await {
            Message::Error(e) => {
                assert_eq!(e.id, 2);
                assert_eq!(e.error.code, ErrorCode::MethodNotFound);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_params_are_invalid_params() {
        let mut peer = Peer::new();
        let mut dispatcher = dispatcher(4);

        let request = Request::new(3, "generate").with_params(json!({"wrong": 1}));
        dispatcher.dispatch(request.into(), &peer.outbound);
        match peer.next().await {
            Message::Error(e) => assert_eq!(e.error.code, ErrorCode::InvalidParams),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_application_error_code_passes_through() {
        let mut peer = Peer::new();
        let mut dispatcher = dispatcher(4);

        dispatcher.dispatch(Request::new(4, "quota").into(), &peer.outbound);
        match peer.next().await {
            Message::Error(e) => {
                assert_eq!(e.error.code, ErrorCode::Application(4001));
                assert_eq!(e.error.message, "quota exceeded");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let mut peer = Peer::new();
        let mut dispatcher = dispatcher(4);

        dispatcher.dispatch(Request::new(5, "boom").into(), &peer.outbound);
        match peer.next().await {
            Message::Error(e) => assert_eq!(e.error.code, ErrorCode::InternalError),
            other => panic!("unexpected {:?}", other),
        }

        // The connection keeps serving.
        dispatcher.dispatch(Request::new(6, "ping").into(), &peer.outbound);
        assert_eq!(peer.next().await.id(), Some(6));
    }

    #[tokio::test]
    async fn test_streaming_partials_precede_final() {
        let mut peer = Peer::new();
        let mut dispatcher = dispatcher(4);

        let request = Request::new(7, "generate").with_params(json!({"prompt": "a b c"}));
        dispatcher.dispatch(request.into(), &peer.outbound);

        for word in ["a", "b", "c"] {
            assert_eq!(
                peer.next().await,
                Message::from(Response::partial(7, json!(word)))
            );
        }
        assert_eq!(
            peer.next().await,
            Message::from(Response::ok(7, json!({"done": true})))
        );
    }

    #[tokio::test]
    async fn test_notification_gets_no_reply() {
        let mut peer = Peer::new();
        let mut dispatcher = dispatcher(4);

        dispatcher.dispatch(Notification::new("ping", Value::Null).into(), &peer.outbound);
        dispatcher.dispatch(Notification::new("missing", Value::Null).into(), &peer.outbound);
        dispatcher.dispatch(Request::new(8, "ping").into(), &peer.outbound);

        // Only the request is answered.
        assert_eq!(peer.next().await.id(), Some(8));
    }

    #[tokio::test]
    async fn test_cancel_aborts_handler_without_reply() {
        let mut peer = Peer::new();
        let mut dispatcher = dispatcher(4);

        dispatcher.dispatch(Request::new(9, "sleep").into(), &peer.outbound);
        while dispatcher.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(dispatcher.cancel(9));
        assert!(!dispatcher.cancel(9));

        dispatcher.dispatch(Request::new(10, "ping").into(), &peer.outbound);
        assert_eq!(peer.next().await.id(), Some(10));
    }

    #[tokio::test]
    async fn test_worker_limit_bounds_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handlers = Handlers::new();
        {
            let running = running.clone();
            let peak = peak.clone();
            handlers.register_fn("work", move |_: Value, _ctx| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(Value::Null)
                }
            });
        }

        let mut peer = Peer::new();
        let mut dispatcher =
            Dispatcher::new(Arc::new(handlers), 2, Compartment::Application, "limit");
        for id in 0..6 {
            dispatcher.dispatch(Request::new(id, "work").into(), &peer.outbound);
        }
        for _ in 0..6 {
            peer.next().await;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_queue_limit_refuses_excess_requests() {
        let mut peer = Peer::new();
        let mut dispatcher =
            Dispatcher::new(handlers(), 1, Compartment::Network, "flood").with_queue_limit(2);

        // One running, two waiting, the rest refused outright.
        for id in 0..5 {
            dispatcher.dispatch(Request::new(id, "sleep").into(), &peer.outbound);
        }
        for expected in [3, 4] {
            match peer.next().await {
                Message::Error(e) => {
                    assert_eq!(e.id, expected);
                    assert_eq!(e.error.code, ErrorCode::InternalError);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(dispatcher.tasks.len(), 3);

        // Freeing the running slot lets a new request queue again.
        while dispatcher.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(dispatcher.cancel(0));
        while dispatcher.tasks.len() == 3 {
            tokio::task::yield_now().await;
            while dispatcher.tasks.try_join_next().is_some() {}
        }
        dispatcher.dispatch(Request::new(5, "ping").into(), &peer.outbound);
        assert_eq!(dispatcher.tasks.len(), 3);
    }

    #[test]
    fn test_reserved_names_are_refused() {
        let mut handlers = Handlers::new();
        handlers.register_fn("engine.ping", |_: Value, _ctx| async move { Ok::<_, HandlerError>(Value::Null) });
        handlers.register_fn("status", |_: Value, _ctx| async move { Ok::<_, HandlerError>(Value::Null) });
        assert!(!handlers.contains("engine.ping"));
        assert_eq!(handlers.methods(), vec!["status"]);
    }
}
