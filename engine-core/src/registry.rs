//! Outstanding calls awaiting a response.
//!
//! Each call gets an id that is unique among the calls still pending on its
//! connection. The entry leaves the table exactly once: on a terminal
//! response, on its deadline, when the caller gives up, or when the
//! connection is lost. Whatever arrives for an id after that is discarded.

use crate::error::CallError;
use crate::writer::Outbound;
use engine_protocol::{Message, Notification, Request, RequestId};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// One step in the life of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// A partial result; more follow.
    Partial(Value),
    /// The final outcome. Nothing follows.
    Done(Result<Value, CallError>),
}

struct Entry {
    method: String,
    timeout: Duration,
    events: mpsc::UnboundedSender<CallEvent>,
    timer: AbortHandle,
}

struct Inner {
    calls: HashMap<RequestId, Entry>,
    next_id: RequestId,
    closed: Option<CallError>,
}

/// Table of outstanding calls for one connection.
#[derive(Clone)]
pub struct PendingCalls {
    inner: Arc<Mutex<Inner>>,
    default_timeout: Duration,
}

impl PendingCalls {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                calls: HashMap::new(),
                next_id: 1,
                closed: None,
            })),
            default_timeout,
        }
    }

    /// Registers a new call and builds the request that starts it.
    ///
    /// Fails with the loss reason once [`fail_all`](Self::fail_all) has run.
    pub fn issue(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<(Request, PendingCall), CallError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.closed {
            return Err(reason.clone());
        }
        let id = inner.next_id;
        inner.next_id += 1;

        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&weak, id);
        });

        inner.calls.insert(
            id,
            Entry {
                method: method.to_string(),
                timeout,
                events: tx,
                timer: timer.abort_handle(),
            },
        );
        drop(inner);

        tracing::trace!("Issued call id={} method={}", id, method);

        let request = Request::new(id, method).with_params(params);
        let pending = PendingCall {
            id,
            events: rx,
            registry: self.clone(),
            finished: false,
            cancel_notice: None,
        };
        Ok((request, pending))
    }

    /// Delivers a response or error to its call.
    ///
    /// Returns `false` when no call is waiting for the id, in which case the
    /// message is dropped.
    pub fn resolve(&self, message: Message) -> bool {
        let (id, event) = match message {
            Message::Response(response) if response.stream.is_terminal() => {
                (response.id, CallEvent::Done(Ok(response.result)))
            }
            Message::Response(response) => (response.id, CallEvent::Partial(response.result)),
            Message::Error(error) => (error.id, CallEvent::Done(Err(error.error.into()))),
            other => {
                tracing::warn!("Registry asked to resolve a non-response: {:?}", other);
                return false;
            }
        };

        let mut inner = self.inner.lock();
        match event {
            CallEvent::Partial(_) => {
                let Some(entry) = inner.calls.get(&id) else {
                    tracing::debug!("Discarding partial response for unknown call id={}", id);
                    return false;
                };
                if entry.events.send(event).is_err() {
                    // Caller went away between cancel checks.
                    if let Some(entry) = inner.calls.remove(&id) {
                        entry.timer.abort();
                    }
                }
                true
            }
            CallEvent::Done(_) => {
                let Some(entry) = inner.calls.remove(&id) else {
                    tracing::debug!("Discarding late response for call id={}", id);
                    return false;
                };
                entry.timer.abort();
                let _ = entry.events.send(event);
                true
            }
        }
    }

    /// Removes a call without delivering anything to it.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.inner.lock().calls.remove(&id) {
            Some(entry) => {
                entry.timer.abort();
                tracing::debug!("Cancelled call id={} method={}", id, entry.method);
                true
            }
            None => false,
        }
    }

    /// Fails every outstanding call with `reason` and refuses new ones.
    ///
    /// Returns the number of calls that were failed.
    pub fn fail_all(&self, reason: CallError) -> usize {
        let mut inner = self.inner.lock();
        inner.closed = Some(reason.clone());
        let calls: Vec<(RequestId, Entry)> = inner.calls.drain().collect();
        drop(inner);

        let count = calls.len();
        for (id, entry) in calls {
            entry.timer.abort();
            tracing::debug!("Failing call id={} method={}: {}", id, entry.method, reason);
            let _ = entry.events.send(CallEvent::Done(Err(reason.clone())));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}

fn expire(inner: &Weak<Mutex<Inner>>, id: RequestId) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let entry = inner.lock().calls.remove(&id);
    if let Some(entry) = entry {
        tracing::warn!(
            "Call id={} method={} timed out after {:?}",
            id,
            entry.method,
            entry.timeout
        );
        let _ = entry
            .events
            .send(CallEvent::Done(Err(CallError::Timeout(entry.timeout))));
    }
}

/// The caller's side of an outstanding call.
///
/// Dropping it before the terminal event removes the call from the registry
/// and, when attached to a live connection, asks the peer to stop working on
/// it.
pub struct PendingCall {
    id: RequestId,
    events: mpsc::UnboundedReceiver<CallEvent>,
    registry: PendingCalls,
    finished: bool,
    cancel_notice: Option<Outbound>,
}

impl PendingCall {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Sends `engine.cancel` on `outbound` if the call is abandoned.
    pub fn with_cancel_notice(mut self, outbound: Outbound) -> Self {
        self.cancel_notice = Some(outbound);
        self
    }

    /// Waits for the next event. Returns `None` once the terminal event has
    /// been delivered.
    pub async fn next(&mut self) -> Option<CallEvent> {
        if self.finished {
            return None;
        }
        match self.events.recv().await {
            Some(CallEvent::Partial(value)) => Some(CallEvent::Partial(value)),
            Some(done) => {
                self.finished = true;
                Some(done)
            }
            None => {
                self.finished = true;
                Some(CallEvent::Done(Err(CallError::Cancelled)))
            }
        }
    }

    /// Waits for the final result, skipping any partial results.
    pub async fn result(mut self) -> Result<Value, CallError> {
        loop {
            match self.next().await {
                Some(CallEvent::Partial(_)) => continue,
                Some(CallEvent::Done(result)) => return result,
                None => return Err(CallError::Cancelled),
            }
        }
    }

    /// Waits for the whole stream: every partial result, then the final one.
    pub async fn collect(mut self) -> Result<(Vec<Value>, Value), CallError> {
        let mut partials = Vec::new();
        loop {
            match self.next().await {
                Some(CallEvent::Partial(value)) => partials.push(value),
                Some(CallEvent::Done(result)) => return result.map(|last| (partials, last)),
                None => return Err(CallError::Cancelled),
            }
        }
    }

    /// Abandons the call.
    pub fn cancel(self) {}
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.registry.cancel(self.id) {
            if let Some(outbound) = &self.cancel_notice {
                let _ = outbound.try_send(&Notification::cancel(self.id).into());
            }
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_protocol::{ErrorResponse, Response, RpcError};
    use serde_json::json;

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let registry = PendingCalls::new(Duration::from_secs(30));
        let (a, _pa) = registry.issue("ping", Value::Null, None).unwrap();
        let (b, _pb) = registry.issue("ping", Value::Null, None).unwrap();
        let (c, _pc) = registry.issue("ping", Value::Null, None).unwrap();
        assert!(a.id < b.id && b.id < c.id);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_delivers_result_once() {
        let registry = PendingCalls::new(Duration::from_secs(30));
        let (request, pending) = registry.issue("ping", Value::Null, None).unwrap();

        assert!(registry.resolve(Response::ok(request.id, json!({"pong": true})).into()));
        assert_eq!(pending.result().await.unwrap(), json!({"pong": true}));
        assert!(registry.is_empty());

        // A second terminal response for the same id is discarded.
        assert!(!registry.resolve(Response::ok(request.id, json!(1)).into()));
    }

    #[tokio::test]
    async fn test_error_response_maps_to_call_error() {
        let registry = PendingCalls::new(Duration::from_secs(30));
        let (request, pending) = registry.issue("nope", Value::Null, None).unwrap();

        registry.resolve(ErrorResponse::new(request.id, RpcError::method_not_found("nope")).into());
        let err = pending.result().await.unwrap_err();
        assert!(matches!(err, CallError::MethodNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_is_discarded() {
        let registry = PendingCalls::new(Duration::from_secs(30));
        let (request, pending) = registry
            .issue("slow", Value::Null, Some(Duration::from_millis(50)))
            .unwrap();

        let err = pending.result().await.unwrap_err();
        assert_eq!(err, CallError::Timeout(Duration::from_millis(50)));
        assert!(registry.is_empty());

        assert!(!registry.resolve(Response::ok(request.id, json!("late")).into()));
    }

    #[tokio::test]
    async fn test_streaming_events_arrive_in_order() {
        let registry = PendingCalls::new(Duration::from_secs(30));
        let (request, mut pending) = registry.issue("generate", Value::Null, None).unwrap();

        for token in ["This ", "is ", "a "] {
            registry.resolve(Response::partial(request.id, json!(token)).into());
        }
        registry.resolve(Response::ok(request.id, json!({"done": true})).into());

        assert_eq!(pending.next().await, Some(CallEvent::Partial(json!("This "))));
        assert_eq!(pending.next().await, Some(CallEvent::Partial(json!("is "))));
        assert_eq!(pending.next().await, Some(CallEvent::Partial(json!("a "))));
        assert_eq!(
            pending.next().await,
            Some(CallEvent::Done(Ok(json!({"done": true}))))
        );
        assert_eq!(pending.next().await, None);
    }

    #[tokio::test]
    async fn test_collect_gathers_partials() {
        let registry = PendingCalls::new(Duration::from_secs(30));
        let (request, pending) = registry.issue("generate", Value::Null, None).unwrap();
        registry.resolve(Response::partial(request.id, json!(1)).into());
        registry.resolve(Response::partial(request.id, json!(2)).into());
        registry.resolve(Response::ok(request.id, json!(3)).into());

        let (partials, last) = pending.collect().await.unwrap();
        assert_eq!(partials, vec![json!(1), json!(2)]);
        assert_eq!(last, json!(3));
    }

    #[tokio::test]
    async fn test_fail_all_fans_out_and_closes() {
        let registry = PendingCalls::new(Duration::from_secs(30));
        let pending: Vec<PendingCall> = (0..5)
            .map(|_| registry.issue("work", Value::Null, None).unwrap().1)
            .collect();

        let reason = CallError::ConnectionLost("peer closed".to_string());
        assert_eq!(registry.fail_all(reason.clone()), 5);

        for call in pending {
            assert_eq!(call.result().await.unwrap_err(), reason);
        }
        assert!(registry.is_closed());
        assert_eq!(
            registry.issue("work", Value::Null, None).unwrap_err(),
            reason
        );
    }

    #[tokio::test]
    async fn test_dropping_call_frees_slot() {
        let registry = PendingCalls::new(Duration::from_secs(30));
        let (request, pending) = registry.issue("work", Value::Null, None).unwrap();
        assert_eq!(registry.len(), 1);

        pending.cancel();
        assert!(registry.is_empty());
        assert!(!registry.resolve(Response::ok(request.id, Value::Null).into()));
    }
}
