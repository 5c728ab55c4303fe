//! Call dispatch.
//!
//! The handler side of every call runs through a `Dispatcher`: it looks the
//! command up, applies context bindings, runs the handler on its own task and
//! shapes the results into the response envelopes of the request's call type.
//! The caller side lives in [`calls`].
//!
//! # Call types
//!
//! | call type | request side | response side |
//! |---|---|---|
//! | `call` | one request | one response (`close`) |
//! | `responsestream` | one request | elements, then `close` |
//! | `streamingrequest` | request + fragments | one response (`close`) |
//! | `complex` | request + fragments | elements, then `close` |

pub mod calls;
pub mod handler;
pub mod stream;

pub use calls::{
    new_reqid, ComplexCall, PendingCalls, RequestSender, ResponseStream, StreamingRequestCall,
};
pub use handler::{HandlerContext, HandlerRegistry, RegisteredHandler};
pub use stream::{RequestStream, ResponseSink};

use crate::cancel::CancellationToken;
use crate::config::RouterConfig;
use crate::context::BindingTable;
use crate::error::{Result, RpcError};
use crate::types::RpcContext;
use crate::wire::{encode, Envelope, Outcome, RpcFragment, RpcRequest, RpcResponse};
use bytes::Bytes;
use handler::HandlerFn;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Handler-side state of one in-flight call.
#[derive(Debug)]
struct ActiveCall {
    cancel: CancellationToken,
    /// Open while the caller may still send fragments.
    fragments: Option<mpsc::UnboundedSender<Value>>,
}

/// A call is identified by the caller's route and its reqid; envelopes from
/// another source never reach it.
type CallKey = (Option<String>, String);

fn call_key(source: Option<&str>, reqid: &str) -> CallKey {
    (source.map(str::to_string), reqid.to_string())
}

#[derive(Debug, Default)]
struct ActiveCalls {
    calls: Mutex<HashMap<CallKey, ActiveCall>>,
}

impl ActiveCalls {
    fn insert(&self, key: CallKey, call: ActiveCall) {
        let previous = self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), call);
        if let Some(previous) = previous {
            warn!("Request id {} from {:?} reused while still active", key.1, key.0);
            previous.cancel.cancel();
        }
    }

    fn remove(&self, key: &CallKey) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Where the responses of one call go.
#[derive(Debug, Clone)]
struct Reply {
    reqid: Option<String>,
    /// Route of the caller.
    route: Option<String>,
    /// Route of the handler side.
    source: Option<String>,
    tx: mpsc::Sender<Bytes>,
}

impl Reply {
    async fn send(&self, outcome: Option<Outcome>, close: bool) {
        let Some(reqid) = &self.reqid else {
            return;
        };
        let envelope = Envelope::Response(RpcResponse {
            resid: reqid.clone(),
            route: self.route.clone(),
            source: self.source.clone(),
            outcome,
            close,
        });
        match encode(&envelope) {
            Ok(frame) => {
                if self.tx.send(frame).await.is_err() {
                    debug!("Caller of {} is gone, response dropped", reqid);
                }
            }
            Err(e) => error!("Failed to encode response for {}: {}", reqid, e),
        }
    }

    /// Terminal single-result response.
    async fn finish(&self, result: Result<Value>) {
        if let (Err(e), None) = (&result, &self.reqid) {
            warn!("Fire-and-forget handler failed: {}", e);
        }
        self.send(Some(result.into()), true).await;
    }

    async fn fail(&self, err: RpcError) {
        self.finish(Err(err)).await;
    }
}

/// Runs handlers for inbound requests and tracks the calls they serve.
#[derive(Debug)]
pub struct Dispatcher {
    handlers: HandlerRegistry,
    bindings: BindingTable,
    stream_buffer_size: usize,
    active: Arc<ActiveCalls>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(BindingTable::default(), RouterConfig::STREAM_BUFFER_SIZE)
    }
}

impl Dispatcher {
    pub fn new(bindings: BindingTable, stream_buffer_size: usize) -> Self {
        Self {
            handlers: HandlerRegistry::new(),
            bindings,
            stream_buffer_size: stream_buffer_size.max(1),
            active: Arc::new(ActiveCalls::default()),
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    /// Serve one inbound request.
    ///
    /// `ctx` is the sender's routing context used for injection. Responses are
    /// addressed back to the request's `source` and written to `reply_tx`;
    /// `local_route` is stamped as their source.
    pub async fn dispatch_request(
        &self,
        request: RpcRequest,
        ctx: Arc<RpcContext>,
        reply_tx: mpsc::Sender<Bytes>,
        local_route: Option<&str>,
    ) {
        let RpcRequest {
            command,
            calltype,
            reqid,
            source,
            mut data,
            ..
        } = request;
        let reply = Reply {
            reqid: reqid.clone(),
            route: source.clone(),
            source: local_route.map(str::to_string),
            tx: reply_tx,
        };

        debug!(
            "Dispatching {} ({}) reqid={:?} from {:?}",
            command, calltype, reqid, source
        );

        let Some(handler) = self.handlers.get(&command) else {
            warn!("No handler for command {:?}", command);
            reply.fail(RpcError::UnknownCommand { command }).await;
            return;
        };
        if handler.call_type() != calltype {
            let err = RpcError::protocol(format!(
                "{} is served as {}, not {}",
                command,
                handler.call_type(),
                calltype
            ));
            reply.fail(err).await;
            return;
        }

        let invalid = self.bindings.inject(&mut data, handler.bindings, &ctx);
        if !invalid.is_empty() {
            debug!("{} invalid binding(s) skipped for {}", invalid.len(), command);
        }

        let cancel = CancellationToken::new();
        let fragments = if calltype.streams_requests() {
            let (tx, rx) = mpsc::unbounded_channel();
            Some((tx, RequestStream::new(rx, cancel.clone())))
        } else {
            None
        };
        let (fragment_tx, fragment_stream) = match fragments {
            Some((tx, stream)) => (Some(tx), stream),
            None => (None, RequestStream::closed(cancel.clone())),
        };

        let key = reqid
            .as_deref()
            .map(|id| call_key(source.as_deref(), id));
        if let Some(key) = &key {
            self.active.insert(
                key.clone(),
                ActiveCall {
                    cancel: cancel.clone(),
                    fragments: fragment_tx,
                },
            );
        }

        let hctx = HandlerContext {
            rpc: ctx,
            source,
            command,
            reqid: reqid.clone(),
            cancel,
        };
        let active = self.active.clone();
        let buffer = self.stream_buffer_size;
        tokio::spawn(async move {
            run_handler(handler.func, hctx, data, fragment_stream, reply, buffer).await;
            if let Some(key) = key {
                active.remove(&key);
            }
        });
    }

    /// Feed a request fragment to its call. Fragments for unknown calls, or
    /// from a source other than the caller, are dropped.
    pub fn dispatch_fragment(&self, fragment: RpcFragment) {
        let key = call_key(fragment.source.as_deref(), &fragment.reqid);
        let mut calls = self.active.calls.lock().unwrap_or_else(|e| e.into_inner());
        let Some(call) = calls.get_mut(&key) else {
            debug!(
                "Fragment for unknown call {} from {:?}",
                fragment.reqid, fragment.source
            );
            return;
        };
        match (&call.fragments, fragment.data) {
            (Some(tx), Some(data)) => {
                let _ = tx.send(data);
            }
            (None, Some(_)) => debug!("Fragment after close for {}", fragment.reqid),
            _ => {}
        }
        if fragment.close {
            call.fragments = None;
        }
    }

    /// Cancel the handler side of the call `source` opened as `reqid`.
    /// Unknown calls are ignored.
    pub fn dispatch_cancel(&self, reqid: &str, source: Option<&str>) {
        let key = call_key(source, reqid);
        let mut calls = self.active.calls.lock().unwrap_or_else(|e| e.into_inner());
        match calls.get_mut(&key) {
            Some(call) => {
                debug!("Cancelling call {} from {:?}", reqid, source);
                call.fragments = None;
                call.cancel.cancel();
            }
            None => debug!("Cancel for unknown call {} from {:?}", reqid, source),
        }
    }

    /// Cancel every call opened by one of `routes`.
    pub fn cancel_from(&self, routes: &[String]) {
        let calls = self.active.calls.lock().unwrap_or_else(|e| e.into_inner());
        for ((source, _), call) in calls.iter() {
            if source
                .as_ref()
                .is_some_and(|s| routes.iter().any(|r| r == s))
            {
                call.cancel.cancel();
            }
        }
    }

    pub fn cancel_all(&self) {
        let mut calls = self.active.calls.lock().unwrap_or_else(|e| e.into_inner());
        for (_, call) in calls.drain() {
            call.cancel.cancel();
        }
    }

    /// Number of calls whose handlers are still running.
    pub fn active_calls(&self) -> usize {
        self.active
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

async fn run_handler(
    func: HandlerFn,
    ctx: HandlerContext,
    data: Value,
    fragments: RequestStream,
    reply: Reply,
    buffer: usize,
) {
    let cancel = ctx.cancel.clone();
    match func {
        HandlerFn::Call(f) => {
            let result = f(ctx, data).await;
            if !cancel.is_cancelled() {
                reply.finish(result).await;
            }
        }
        HandlerFn::StreamingRequest(f) => {
            let result = f(ctx, data, fragments).await;
            if !cancel.is_cancelled() {
                reply.finish(result).await;
            }
        }
        HandlerFn::ResponseStream(f) => {
            let (sink, pump) = open_sink(&reply, &cancel, buffer);
            finish_stream(&reply, &cancel, pump, f(ctx, data, sink)).await;
        }
        HandlerFn::Complex(f) => {
            let (sink, pump) = open_sink(&reply, &cancel, buffer);
            finish_stream(&reply, &cancel, pump, f(ctx, data, fragments, sink)).await;
        }
    }
}

/// Bounded per-call queue between a streaming handler and the connection.
fn open_sink(
    reply: &Reply,
    cancel: &CancellationToken,
    buffer: usize,
) -> (ResponseSink, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Result<Value>>(buffer);
    let sink = ResponseSink::new(tx, cancel.clone());
    let reply = reply.clone();
    let cancel = cancel.clone();
    let pump = tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                item = rx.recv() => item,
                _ = cancel.cancelled() => None,
            };
            let Some(item) = item else {
                break;
            };
            tokio::select! {
                _ = reply.send(Some(item.into()), false) => {}
                _ = cancel.cancelled() => break,
            }
        }
    });
    (sink, pump)
}

/// Drive a streaming handler to completion. The response side closes as soon
/// as the handler drops every sink, even while it keeps reading requests.
async fn finish_stream<F>(
    reply: &Reply,
    cancel: &CancellationToken,
    mut pump: tokio::task::JoinHandle<()>,
    handler: F,
) where
    F: Future<Output = Result<()>>,
{
    tokio::pin!(handler);
    let result = tokio::select! {
        biased;
        result = &mut handler => result,
        joined = &mut pump => {
            if let Err(e) = joined {
                error!("Response pump failed: {}", e);
            }
            if !cancel.is_cancelled() {
                reply.send(None, true).await;
            }
            if let Err(e) = handler.await {
                warn!("Handler {:?} failed after closing its responses: {}", reply.reqid, e);
            }
            return;
        }
    };
    close_stream(reply, cancel, pump, result).await;
}

async fn close_stream(
    reply: &Reply,
    cancel: &CancellationToken,
    pump: tokio::task::JoinHandle<()>,
    result: Result<()>,
) {
    if let Err(e) = pump.await {
        error!("Response pump failed: {}", e);
    }
    if cancel.is_cancelled() {
        return;
    }
    match result {
        Ok(()) => reply.send(None, true).await,
        Err(e) => reply.send(Some(Outcome::Error(e.to_wire())), true).await,
    }
}
