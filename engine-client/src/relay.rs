//! Forwarding calls to another compartment.
//!
//! A [`Relay`] serves a method by calling the same method on an upstream
//! [`Client`]. Partial results are passed through as they arrive, so a
//! streaming upstream stays streaming for the original caller. If the
//! caller cancels, the upstream call is cancelled with it.

use crate::client::Client;
use engine_core::dispatcher::BoxFuture;
use engine_core::{CallContext, CallError, CallEvent, Handler, HandlerError, HandlerResult, Handlers};
use serde_json::Value;
use std::sync::Arc;

/// Handler that forwards every call to `upstream`.
#[derive(Debug, Clone)]
pub struct Relay {
    upstream: Client,
    method: Arc<str>,
}

impl Relay {
    pub fn new(upstream: Client, method: &str) -> Self {
        Self {
            upstream,
            method: Arc::from(method),
        }
    }

    /// Registers a relay for each of `methods` on `handlers`.
    pub fn register_all(handlers: &mut Handlers, upstream: &Client, methods: &[&str]) {
        for method in methods {
            handlers.register(method, Relay::new(upstream.clone(), method));
        }
    }
}

impl Handler for Relay {
    fn call(&self, params: Value, ctx: CallContext) -> BoxFuture<'static, HandlerResult> {
        let upstream = self.upstream.clone();
        let method = self.method.clone();
        Box::pin(async move {
            tracing::debug!(
                "[{}] Relaying {} from {} upstream",
                ctx.session_id(),
                method,
                ctx.peer()
            );
            // Dropping `call` (caller cancelled us) cancels upstream too.
            let mut call = upstream.call_streaming(&method, params, None).await?;
            while let Some(event) = call.next().await {
                match event {
                    CallEvent::Partial(chunk) => ctx.partial(&chunk).await?,
                    CallEvent::Done(result) => return Ok(result?),
                }
            }
            Err(HandlerError::from(CallError::ConnectionLost(format!(
                "upstream {} ended without a result",
                method
            ))))
        })
    }
}
