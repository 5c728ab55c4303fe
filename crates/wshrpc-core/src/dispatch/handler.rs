//! Command handler registry.
//!
//! Handlers are registered with a typed signature per call type and stored
//! type-erased over `serde_json::Value`:
//!
//! - **Call**: `(ctx, payload) -> result`
//! - **ResponseStream**: `(ctx, payload, sink)`
//! - **StreamingRequest**: `(ctx, payload, fragments) -> result`
//! - **Complex**: `(ctx, payload, fragments, sink)`
//!
//! Handlers return `anyhow::Result`. A handler error is reported to the caller
//! as `HandlerError` with the error's message unchanged, unless the error is an
//! `RpcError` itself (for example `Cancelled` propagated from a sink), which is
//! passed through as is.

use super::stream::{RequestStream, ResponseSink};
use crate::cancel::CancellationToken;
use crate::context::{ContextBound, FieldBinding};
use crate::error::{Result, RpcError};
use crate::types::RpcContext;
use crate::wire::CallType;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Everything a handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Routing context of the sender, empty when unknown.
    pub rpc: Arc<RpcContext>,
    /// Route of the sender, if it announced one.
    pub source: Option<String>,
    pub command: String,
    /// Correlation id; `None` for fire-and-forget requests.
    pub reqid: Option<String>,
    /// Flipped when the caller cancels the call.
    pub cancel: CancellationToken,
}

impl HandlerContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub(crate) type CallFn =
    Arc<dyn Fn(HandlerContext, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
pub(crate) type ResponseStreamFn =
    Arc<dyn Fn(HandlerContext, Value, ResponseSink) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub(crate) type StreamingRequestFn = Arc<
    dyn Fn(HandlerContext, Value, RequestStream) -> BoxFuture<'static, Result<Value>> + Send + Sync,
>;
pub(crate) type ComplexFn = Arc<
    dyn Fn(HandlerContext, Value, RequestStream, ResponseSink) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub(crate) enum HandlerFn {
    Call(CallFn),
    ResponseStream(ResponseStreamFn),
    StreamingRequest(StreamingRequestFn),
    Complex(ComplexFn),
}

impl HandlerFn {
    fn call_type(&self) -> CallType {
        match self {
            HandlerFn::Call(_) => CallType::Call,
            HandlerFn::ResponseStream(_) => CallType::ResponseStream,
            HandlerFn::StreamingRequest(_) => CallType::StreamingRequest,
            HandlerFn::Complex(_) => CallType::Complex,
        }
    }
}

/// A handler as stored in the registry.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub(crate) bindings: &'static [FieldBinding],
    pub(crate) func: HandlerFn,
}

impl RegisteredHandler {
    pub fn call_type(&self) -> CallType {
        self.func.call_type()
    }

    /// Context bindings declared by the handler's payload type.
    pub fn bindings(&self) -> &'static [FieldBinding] {
        self.bindings
    }
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("call_type", &self.call_type())
            .field("bindings", &self.bindings)
            .finish()
    }
}

/// Decode a request payload. A null payload is read as an empty object when the
/// target type does not accept null.
pub(crate) fn decode_payload<T: DeserializeOwned>(command: &str, data: Value) -> Result<T> {
    let invalid =
        |e: serde_json::Error| RpcError::protocol(format!("invalid payload for {command}: {e}"));
    if data.is_null() {
        if let Ok(v) = serde_json::from_value(Value::Null) {
            return Ok(v);
        }
        return serde_json::from_value(Value::Object(Map::new())).map_err(invalid);
    }
    serde_json::from_value(data).map_err(invalid)
}

/// Map a handler failure onto the wire error. Cancellation keeps its kind;
/// every other failure is reported as a handler error with its message.
pub(crate) fn handler_error(err: anyhow::Error) -> RpcError {
    match err.downcast_ref::<RpcError>() {
        Some(RpcError::Cancelled) => RpcError::Cancelled,
        _ => RpcError::handler(&err),
    }
}

/// Command name → handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, RegisteredHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("commands", &self.commands())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, command: String, bindings: &'static [FieldBinding], func: HandlerFn) {
        let call_type = func.call_type();
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(command.clone(), RegisteredHandler { bindings, func })
            .is_some();
        debug!(
            "Registered {} handler for {}{}",
            call_type,
            command,
            if replaced { " (replaced)" } else { "" }
        );
    }

    /// Register a single-result handler.
    pub fn register_call<Req, Resp, F, Fut>(&self, command: impl Into<String>, f: F)
    where
        Req: DeserializeOwned + ContextBound + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(HandlerContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let command = command.into();
        let name = command.clone();
        let func: CallFn = Arc::new(move |ctx: HandlerContext, data: Value| {
            let pending = decode_payload::<Req>(&name, data).map(|req| f(ctx, req));
            async move {
                let resp = pending?.await.map_err(handler_error)?;
                Ok::<Value, RpcError>(serde_json::to_value(resp)?)
            }
            .boxed()
        });
        self.insert(command, Req::BINDINGS, HandlerFn::Call(func));
    }

    /// Register a handler that streams results through a `ResponseSink`.
    pub fn register_response_stream<Req, F, Fut>(&self, command: impl Into<String>, f: F)
    where
        Req: DeserializeOwned + ContextBound + Send + 'static,
        F: Fn(HandlerContext, Req, ResponseSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let command = command.into();
        let name = command.clone();
        let func: ResponseStreamFn =
            Arc::new(move |ctx: HandlerContext, data: Value, sink: ResponseSink| {
                let pending = decode_payload::<Req>(&name, data).map(|req| f(ctx, req, sink));
                async move {
                    let fut = pending?;
                    fut.await.map_err(handler_error)
                }
                .boxed()
            });
        self.insert(command, Req::BINDINGS, HandlerFn::ResponseStream(func));
    }

    /// Register a handler that consumes request fragments and returns one result.
    pub fn register_streaming_request<Req, Resp, F, Fut>(&self, command: impl Into<String>, f: F)
    where
        Req: DeserializeOwned + ContextBound + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(HandlerContext, Req, RequestStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let command = command.into();
        let name = command.clone();
        let func: StreamingRequestFn =
            Arc::new(move |ctx: HandlerContext, data: Value, fragments: RequestStream| {
                let pending =
                    decode_payload::<Req>(&name, data).map(|req| f(ctx, req, fragments));
                async move {
                    let resp = pending?.await.map_err(handler_error)?;
                    Ok::<Value, RpcError>(serde_json::to_value(resp)?)
                }
                .boxed()
            });
        self.insert(command, Req::BINDINGS, HandlerFn::StreamingRequest(func));
    }

    /// Register a handler that streams in both directions.
    pub fn register_complex<Req, F, Fut>(&self, command: impl Into<String>, f: F)
    where
        Req: DeserializeOwned + ContextBound + Send + 'static,
        F: Fn(HandlerContext, Req, RequestStream, ResponseSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let command = command.into();
        let name = command.clone();
        let func: ComplexFn = Arc::new(
            move |ctx: HandlerContext, data: Value, fragments: RequestStream, sink: ResponseSink| {
                let pending =
                    decode_payload::<Req>(&name, data).map(|req| f(ctx, req, fragments, sink));
                async move {
                    let fut = pending?;
                    fut.await.map_err(handler_error)
                }
                .boxed()
            },
        );
        self.insert(command, Req::BINDINGS, HandlerFn::Complex(func));
    }

    pub fn get(&self, command: &str) -> Option<RegisteredHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(command)
            .cloned()
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(command)
    }

    pub fn unregister(&self, command: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(command)
            .is_some()
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        commands.sort();
        commands
    }
}
