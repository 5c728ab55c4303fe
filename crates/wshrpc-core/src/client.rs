//! Process-side peer of a router connection.
//!
//! An `RpcClient` owns one frame channel. It tracks the calls it has made,
//! serves the commands it has registered handlers for (requests forwarded to
//! its route by the router) and fans received events out to local listeners.
//!
//! # Example
//!
//! ```no_run
//! use wshrpc_core::{Router, RouterOptions, RpcClient, RpcContext, RpcOpts};
//!
//! # async fn demo() -> wshrpc_core::Result<()> {
//! let router = Router::new(RouterOptions::default());
//! router.start();
//!
//! let client = RpcClient::new(router.connect_local()?);
//! client.connect(RpcContext::block_controller("b1")).await?;
//! let meta: serde_json::Value = client
//!     .call("getmeta", serde_json::json!({}), RpcOpts::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{EventConfig, RouterConfig};
use crate::context::BindingTable;
use crate::dispatch::calls::CallLink;
use crate::dispatch::{
    new_reqid, ComplexCall, Dispatcher, HandlerRegistry, PendingCalls, RequestSender,
    ResponseStream, StreamingRequestCall,
};
use crate::error::{Result, RpcError};
use crate::ipc::FrameChannel;
use crate::types::{
    command, CommandAnnounceData, CommandAuthenticateRtnData, CommandEventReadHistoryData,
    RpcContext, SubscriptionRequest, WaveEvent,
};
use crate::wire::{decode, encode, CallType, Envelope, RpcOpts, RpcRequest};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Local fan-out of received events, one broadcast channel per event name.
#[derive(Debug, Default)]
struct EventListeners {
    channels: Mutex<HashMap<String, broadcast::Sender<WaveEvent>>>,
}

impl EventListeners {
    fn subscribe(&self, event: &str) -> broadcast::Receiver<WaveEvent> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(EventConfig::LISTENER_CHANNEL_SIZE).0)
            .subscribe()
    }

    fn dispatch(&self, event: WaveEvent) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        match channels.get(&event.event) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => {
                debug!("No local listener for event {:?}", event.event);
                0
            }
        }
    }
}

struct ClientInner {
    tx: mpsc::Sender<Bytes>,
    dispatcher: Dispatcher,
    pending: Arc<PendingCalls>,
    listeners: Arc<EventListeners>,
    route: RwLock<Option<String>>,
}

/// One peer of a router.
pub struct RpcClient {
    inner: Arc<ClientInner>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("route", &self.route())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl RpcClient {
    /// Start serving a frame channel.
    pub fn new(channel: FrameChannel) -> Self {
        Self::with_bindings(channel, BindingTable::default())
    }

    pub fn with_bindings(channel: FrameChannel, bindings: BindingTable) -> Self {
        let FrameChannel { tx, rx } = channel;
        let listeners = Arc::new(EventListeners::default());
        let inner = Arc::new(ClientInner {
            tx,
            dispatcher: Dispatcher::new(bindings, RouterConfig::STREAM_BUFFER_SIZE),
            pending: Arc::new(PendingCalls::new()),
            listeners: listeners.clone(),
            route: RwLock::new(None),
        });

        inner
            .dispatcher
            .handlers()
            .register_call(command::EVENT_RECV, move |_ctx, event: WaveEvent| {
                let delivered = listeners.dispatch(event);
                async move {
                    debug!("Event delivered to {} local listener(s)", delivered);
                    anyhow::Ok(())
                }
            });

        let reader = tokio::spawn(read_loop(inner.clone(), rx));
        Self { inner, reader }
    }

    /// Connect over TCP.
    pub async fn connect_tcp(addr: std::net::SocketAddr) -> Result<Self> {
        Ok(Self::new(crate::ipc::connect_tcp(addr).await?))
    }

    // === Handshake ===

    /// Ask the router for a fresh route.
    pub async fn authenticate(&self) -> Result<String> {
        let opts = RpcOpts::default().with_timeout(RouterConfig::HANDSHAKE_TIMEOUT);
        let rtn: CommandAuthenticateRtnData =
            self.call(command::AUTHENTICATE, Value::Null, opts).await?;
        Ok(rtn.route_id)
    }

    /// Register `route` with its context on the router.
    pub async fn announce(&self, route: &str, ctx: RpcContext) -> Result<()> {
        let opts = RpcOpts::default().with_timeout(RouterConfig::HANDSHAKE_TIMEOUT);
        let data = CommandAnnounceData {
            route_id: route.to_string(),
            ctx,
        };
        let _: Value = self.call(command::ANNOUNCE, data, opts).await?;
        self.inner
            .route
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert_with(|| route.to_string());
        Ok(())
    }

    /// Authenticate and announce; returns the route now served by this client.
    pub async fn connect(&self, ctx: RpcContext) -> Result<String> {
        let route = self.authenticate().await?;
        self.announce(&route, ctx).await?;
        Ok(route)
    }

    /// The first route announced by this client.
    pub fn route(&self) -> Option<String> {
        self.inner
            .route
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Handlers for commands addressed to this client's routes.
    pub fn handlers(&self) -> &HandlerRegistry {
        self.inner.dispatcher.handlers()
    }

    // === Calls ===

    /// Single-result call. With `noresponse` set, resolves as soon as the
    /// request is queued and yields the value decoded from `null`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        command: &str,
        data: impl Serialize,
        opts: RpcOpts,
    ) -> Result<T> {
        let value = self.call_value(command, serde_json::to_value(data)?, opts).await?;
        serde_json::from_value(value).map_err(RpcError::from)
    }

    pub async fn call_value(&self, command: &str, data: Value, opts: RpcOpts) -> Result<Value> {
        if opts.noresponse {
            self.send_request(command, CallType::Call, None, data, opts)
                .await?;
            return Ok(Value::Null);
        }

        // The timeout covers queueing the request as well as the reply.
        let started = tokio::time::Instant::now();
        let reqid = new_reqid();
        let mut rx = self.inner.pending.register(&reqid);
        let timeout = opts.timeout();
        let exchange = async {
            self.send_request(command, CallType::Call, Some(reqid.as_str()), data, opts)
                .await?;
            rx.recv().await.unwrap_or(Err(RpcError::Disconnected))
        };
        let result = match timeout {
            Some(timeout) => tokio::time::timeout_at(started + timeout, exchange)
                .await
                .unwrap_or_else(|_| {
                    debug!("{} ({}) timed out after {:?}", command, reqid, timeout);
                    Err(RpcError::TimedOut(timeout))
                }),
            None => exchange.await,
        };
        if result.is_err() {
            self.inner.pending.remove(&reqid);
        }
        result
    }

    /// Fire-and-forget request.
    pub async fn send_command(&self, command: &str, data: impl Serialize, opts: RpcOpts) -> Result<()> {
        let data = serde_json::to_value(data)?;
        self.send_request(command, CallType::Call, None, data, opts.no_response())
            .await
    }

    /// Open a call whose handler streams results back.
    pub async fn response_stream(
        &self,
        command: &str,
        data: impl Serialize,
        opts: RpcOpts,
    ) -> Result<ResponseStream> {
        let (link, rx) = self
            .open(command, CallType::ResponseStream, serde_json::to_value(data)?, opts)
            .await?;
        Ok(ResponseStream::new(link, rx))
    }

    /// Open a call that streams request fragments to a single-result handler.
    pub async fn streaming_request(
        &self,
        command: &str,
        data: impl Serialize,
        opts: RpcOpts,
    ) -> Result<StreamingRequestCall> {
        let timeout = opts.timeout();
        let (link, rx) = self
            .open(command, CallType::StreamingRequest, serde_json::to_value(data)?, opts)
            .await?;
        Ok(StreamingRequestCall::new(
            RequestSender::new(link.clone()),
            ResponseStream::new(link, rx),
            timeout,
        ))
    }

    /// Open a call that streams in both directions.
    pub async fn complex(
        &self,
        command: &str,
        data: impl Serialize,
        opts: RpcOpts,
    ) -> Result<ComplexCall> {
        let (link, rx) = self
            .open(command, CallType::Complex, serde_json::to_value(data)?, opts)
            .await?;
        Ok(ComplexCall {
            requests: RequestSender::new(link.clone()),
            responses: ResponseStream::new(link, rx),
        })
    }

    async fn open(
        &self,
        command: &str,
        calltype: CallType,
        data: Value,
        opts: RpcOpts,
    ) -> Result<(CallLink, mpsc::UnboundedReceiver<Result<Value>>)> {
        if opts.noresponse {
            return Err(RpcError::protocol(format!(
                "{calltype} calls need a response side"
            )));
        }
        let reqid = new_reqid();
        let rx = self.inner.pending.register(&reqid);
        let link = CallLink {
            reqid: reqid.clone(),
            route: opts.route.clone(),
            tx: self.inner.tx.clone(),
            pending: self.inner.pending.clone(),
        };
        if let Err(e) = self
            .send_request(command, calltype, Some(reqid.as_str()), data, opts)
            .await
        {
            self.inner.pending.remove(&reqid);
            return Err(e);
        }
        Ok((link, rx))
    }

    async fn send_request(
        &self,
        command: &str,
        calltype: CallType,
        reqid: Option<&str>,
        data: Value,
        opts: RpcOpts,
    ) -> Result<()> {
        let envelope = Envelope::Request(RpcRequest {
            command: command.to_string(),
            calltype,
            reqid: reqid.map(str::to_string),
            source: None,
            data,
            opts,
        });
        let frame = encode(&envelope)?;
        self.inner
            .tx
            .send(frame)
            .await
            .map_err(|_| RpcError::Disconnected)
    }

    // === Events ===

    /// Publish an event through the router.
    pub async fn publish_event(&self, event: &WaveEvent) -> Result<()> {
        self.call(command::EVENT_PUBLISH, event, RpcOpts::default())
            .await
    }

    /// Subscribe this client's route on the router.
    pub async fn subscribe(&self, request: &SubscriptionRequest) -> Result<()> {
        self.call(command::EVENT_SUB, request, RpcOpts::default())
            .await
    }

    pub async fn unsubscribe(&self, event: &str) -> Result<()> {
        self.call(command::EVENT_UNSUB, event, RpcOpts::default())
            .await
    }

    pub async fn unsubscribe_all(&self) -> Result<()> {
        self.call(command::EVENT_UNSUB_ALL, (), RpcOpts::default())
            .await
    }

    /// Up to `max_items` retained events for `(event, scope)`, oldest first.
    pub async fn read_history(
        &self,
        event: &str,
        scope: &str,
        max_items: usize,
    ) -> Result<Vec<WaveEvent>> {
        let data = CommandEventReadHistoryData {
            event: event.to_string(),
            scope: scope.to_string(),
            max_items,
        };
        self.call(command::EVENT_READ_HISTORY, data, RpcOpts::default())
            .await
    }

    /// Receive events named `event` delivered to this client.
    pub fn subscribe_local(&self, event: &str) -> broadcast::Receiver<WaveEvent> {
        self.inner.listeners.subscribe(event)
    }

    // === State ===

    /// Calls awaiting responses.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// True once the connection to the router is gone.
    pub fn is_closed(&self) -> bool {
        self.reader.is_finished() || self.inner.tx.is_closed()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.inner.pending.fail_all(|| RpcError::Disconnected);
        self.inner.dispatcher.cancel_all();
    }
}

async fn read_loop(inner: Arc<ClientInner>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        let envelope = match decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping undecodable frame from router: {}", e);
                continue;
            }
        };
        match envelope {
            Envelope::Response(response) => {
                inner.pending.deliver(response);
            }
            Envelope::Request(request) => {
                let local_route = inner
                    .route
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                inner
                    .dispatcher
                    .dispatch_request(
                        request,
                        Arc::new(RpcContext::default()),
                        inner.tx.clone(),
                        local_route.as_deref(),
                    )
                    .await;
            }
            Envelope::Fragment(fragment) => inner.dispatcher.dispatch_fragment(fragment),
            Envelope::Cancel(cancel) => inner
                .dispatcher
                .dispatch_cancel(&cancel.reqid, cancel.source.as_deref()),
        }
    }
    debug!("Router connection closed");
    inner.pending.fail_all(|| RpcError::Disconnected);
    inner.dispatcher.cancel_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterOptions;
    use crate::error::ErrorKind;
    use crate::ipc::frame_pair;
    use crate::router::Router;
    use serde_json::json;
    use std::time::Duration;

    fn router() -> Arc<Router> {
        let router = Router::new(RouterOptions::default());
        router.start();
        router
    }

    #[tokio::test]
    async fn test_connect_assigns_route() {
        let router = router();
        let client = RpcClient::new(router.connect_local().unwrap());
        assert!(client.route().is_none());

        let route = client.connect(RpcContext::default()).await.unwrap();
        assert_eq!(client.route(), Some(route.clone()));
        assert!(router.routes().contains(&route));
    }

    #[tokio::test]
    async fn test_call_unknown_command() {
        let router = router();
        let client = RpcClient::new(router.connect_local().unwrap());
        let err = client
            .call::<Value>("nosuchcommand", Value::Null, RpcOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownCommand);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_send_command_resolves_immediately() {
        let router = router();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        router.handlers().register_call(command::MESSAGE, move |_ctx, v: Value| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(v);
                anyhow::Ok(())
            }
        });
        let client = RpcClient::new(router.connect_local().unwrap());
        client
            .send_command(command::MESSAGE, json!({"message": "hi"}), RpcOpts::default())
            .await
            .unwrap();
        assert_eq!(client.pending_calls(), 0);

        let seen = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, json!({"message": "hi"}));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_calls() {
        let (client_end, mut router_end) = frame_pair(8);
        let client = Arc::new(RpcClient::new(client_end));

        let call = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .call_value("getmeta", Value::Null, RpcOpts::default())
                    .await
            }
        });

        // The request reaches the "router", which then goes away.
        assert!(router_end.rx.recv().await.is_some());
        drop(router_end);

        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Disconnected);
    }

    #[tokio::test]
    async fn test_call_timeout_covers_blocked_send() {
        // Nobody reads the far end, so the second frame cannot be queued.
        let (client_end, _router_end) = frame_pair(1);
        let client = RpcClient::new(client_end);
        client
            .send_command("message", json!("fills the queue"), RpcOpts::default())
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            client.call_value(
                "test",
                Value::Null,
                RpcOpts::default().with_timeout(Duration::from_millis(100)),
            ),
        )
        .await
        .expect("timeout fires while the send is blocked")
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_local_listeners_receive_eventrecv() {
        let router = router();
        let client = RpcClient::new(router.connect_local().unwrap());
        client.connect(RpcContext::default()).await.unwrap();
        let mut listener = client.subscribe_local("blockclose");
        client
            .subscribe(&SubscriptionRequest::all("blockclose"))
            .await
            .unwrap();

        router.publish(&WaveEvent::new("blockclose").with_scopes(["b1"]));

        let event = tokio::time::timeout(Duration::from_secs(2), listener.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.scopes, vec!["b1"]);
    }

    #[tokio::test]
    async fn test_streaming_calls_reject_noresponse() {
        let router = router();
        let client = RpcClient::new(router.connect_local().unwrap());
        let err = client
            .response_stream("streamtest", Value::Null, RpcOpts::default().no_response())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }
}
