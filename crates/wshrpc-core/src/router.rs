//! The router: one hub, many connections.
//!
//! Every attached connection gets a reader task. For each inbound frame the
//! router decodes the envelope, stamps the sender's route as `source` when the
//! envelope has none, and then either forwards it unchanged to the connection
//! serving its destination route, or handles it locally (handshake commands,
//! event bus commands and any handler registered on the router).
//!
//! Forwarding failures are answered to the original caller; the router never
//! drops a call with a correlation id silently.

use crate::config::{RouterConfig, RouterOptions};
use crate::context::BindingTable;
use crate::dispatch::handler::decode_payload;
use crate::dispatch::{Dispatcher, HandlerRegistry};
use crate::error::{Result, RpcError};
use crate::events::{EventBus, EventDelivery, PublishReport};
use crate::ipc::{frame_pair, FrameAcceptor, FrameChannel, IpcServer, IpcServerHandle};
use crate::routes::{ConnId, Endpoint, RouteTable};
use crate::types::{
    command, CommandAnnounceData, CommandAuthenticateRtnData, CommandEventReadHistoryData,
    RpcContext, SubscriptionRequest, WaveEvent,
};
use crate::wire::{
    decode, encode, error_response, salvage_reqid, CallType, Envelope, Outcome, RpcFragment,
    RpcOpts, RpcRequest, RpcResponse,
};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Router-side state of one connection, owned by its reader task.
struct Connection {
    id: ConnId,
    peer: String,
    /// Replies to this connection's own requests.
    tx: mpsc::Sender<Bytes>,
    /// Queue drained by the writer task; handed to the route table so other
    /// connections can reach this one without waiting on it.
    outbound: mpsc::UnboundedSender<Bytes>,
    /// First route announced on this connection; stamped as `source`.
    route: Option<String>,
}

impl Connection {
    async fn send(&self, envelope: &Envelope) {
        match encode(envelope) {
            Ok(frame) => {
                if self.tx.send(frame).await.is_err() {
                    debug!("Connection {} gone, dropping {}", self.id, envelope.kind());
                }
            }
            Err(e) => error!("Failed to encode {} for {}: {}", envelope.kind(), self.id, e),
        }
    }
}

/// Process-wide message hub.
pub struct Router {
    options: RouterOptions,
    routes: RouteTable,
    events: EventBus,
    dispatcher: Dispatcher,
    running: AtomicBool,
    next_conn_id: AtomicU64,
    connections: RwLock<HashMap<ConnId, String>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("route", &self.options.route)
            .field("running", &self.is_running())
            .field("routes", &self.routes.routes())
            .finish()
    }
}

impl Router {
    /// Create a stopped router with the default context bindings.
    pub fn new(options: RouterOptions) -> Arc<Self> {
        Self::with_bindings(options, BindingTable::default())
    }

    /// Create a stopped router with a custom binding table.
    pub fn with_bindings(options: RouterOptions, bindings: BindingTable) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let dispatcher = Dispatcher::new(bindings, options.stream_buffer_size);
        let router = Arc::new(Self {
            options,
            routes: RouteTable::new(),
            events: EventBus::new(),
            dispatcher,
            running: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
            shutdown_tx,
        });
        register_event_handlers(&router);
        router
    }

    // === Lifecycle ===

    /// Start accepting connections.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Router {} already running", self.options.route);
            return;
        }
        self.shutdown_tx.send_replace(false);
        info!("Router {} started", self.options.route);
    }

    /// Close every connection and drop all routes, subscriptions and history.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        self.dispatcher.cancel_all();
        self.routes.clear();
        self.events.clear();
        info!("Router {} stopped", self.options.route);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // === Connections ===

    /// Serve a connected frame channel. Returns the router-local connection id.
    pub fn attach(self: &Arc<Self>, channel: FrameChannel, peer: impl Into<String>) -> Result<ConnId> {
        if !self.is_running() {
            return Err(RpcError::Other(format!(
                "router {} is not running",
                self.options.route
            )));
        }
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let peer = peer.into();
        let FrameChannel { tx, rx } = channel;

        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, peer.clone());
        debug!("Connection {} attached ({})", id, peer);

        let (outbound, queued) = mpsc::unbounded_channel();
        tokio::spawn(write_queued(id, queued, tx.clone()));

        let conn = Connection {
            id,
            peer,
            tx,
            outbound,
            route: None,
        };
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(Arc::clone(self).serve_connection(conn, rx, shutdown));
        Ok(id)
    }

    /// Attach an in-process connection and return the peer's end.
    pub fn connect_local(self: &Arc<Self>) -> Result<FrameChannel> {
        let (local, remote) = frame_pair(self.options.frame_queue_size);
        self.attach(remote, "in-process")?;
        Ok(local)
    }

    /// Accept TCP peers on `addr`.
    pub async fn serve_tcp(self: &Arc<Self>, addr: SocketAddr) -> Result<IpcServerHandle> {
        IpcServer::start(Arc::clone(self), addr).await
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    async fn serve_connection(
        self: Arc<Self>,
        mut conn: Connection,
        mut rx: mpsc::Receiver<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => self.handle_frame(&mut conn, &frame).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.disconnect(&conn);
    }

    fn disconnect(&self, conn: &Connection) {
        let released = self.routes.unregister_connection(conn.id);
        for route in &released {
            self.events.unsubscribe_all(route);
        }
        self.dispatcher.cancel_from(&released);
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&conn.id);
        info!(
            "Connection {} ({}) closed, released {:?}",
            conn.id, conn.peer, released
        );
    }

    // === Frame handling ===

    async fn handle_frame(&self, conn: &mut Connection, frame: &[u8]) {
        let mut envelope = match decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Bad frame on connection {}: {}", conn.id, e);
                if let Some(reqid) = salvage_reqid(frame) {
                    conn.send(&error_response(&reqid, conn.route.clone(), &e))
                        .await;
                }
                return;
            }
        };
        if let Some(route) = &conn.route {
            envelope.stamp_source(route);
        }

        debug!(
            "{} {:?} on connection {} -> {:?}",
            envelope.kind(),
            envelope.correlation_id(),
            conn.id,
            envelope.destination()
        );

        match envelope.destination() {
            Some(dest) if !dest.is_empty() && dest != self.options.route => {
                let dest = dest.to_string();
                self.forward(conn, envelope, &dest).await;
            }
            _ => self.handle_local(conn, envelope).await,
        }
    }

    async fn forward(&self, conn: &Connection, envelope: Envelope, dest: &str) {
        if envelope.source().is_none() {
            let err = RpcError::protocol("announce a route before addressing other routes");
            self.reject(conn, &envelope, err).await;
            return;
        }
        let endpoint = match self.routes.lookup(dest) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.reject(conn, &envelope, e).await;
                return;
            }
        };
        if let Err(e) = endpoint.send(&envelope) {
            self.reject(conn, &envelope, e).await;
        }
    }

    /// Fail the call an undeliverable envelope belongs to.
    async fn reject(&self, conn: &Connection, envelope: &Envelope, err: RpcError) {
        match envelope {
            Envelope::Request(RpcRequest {
                reqid: Some(reqid), ..
            })
            | Envelope::Fragment(RpcFragment { reqid, .. }) => {
                debug!("Failing {} on connection {}: {}", reqid, conn.id, err);
                let mut response = error_response(reqid, envelope.source().map(String::from), &err);
                response.stamp_source(&self.options.route);
                conn.send(&response).await;
            }
            Envelope::Request(req) => {
                warn!("Dropped fire-and-forget {}: {}", req.command, err);
            }
            _ => debug!(
                "Dropped {} {:?}: {}",
                envelope.kind(),
                envelope.correlation_id(),
                err
            ),
        }
    }

    async fn handle_local(&self, conn: &mut Connection, envelope: Envelope) {
        match envelope {
            Envelope::Request(request) => match request.command.as_str() {
                command::AUTHENTICATE => self.authenticate(conn, request).await,
                command::ANNOUNCE => self.announce(conn, request).await,
                _ => {
                    let ctx = self.context_of(request.source.as_deref());
                    self.dispatcher
                        .dispatch_request(request, ctx, conn.tx.clone(), Some(&self.options.route))
                        .await;
                }
            },
            Envelope::Fragment(fragment) => self.dispatcher.dispatch_fragment(fragment),
            Envelope::Cancel(cancel) => self
                .dispatcher
                .dispatch_cancel(&cancel.reqid, cancel.source.as_deref()),
            Envelope::Response(response) => {
                debug!("Response {} has no pending call on the router", response.resid)
            }
        }
    }

    /// Routing context of `source`, empty when it is not a live route.
    fn context_of(&self, source: Option<&str>) -> Arc<RpcContext> {
        source
            .and_then(|route| self.routes.lookup(route).ok())
            .map(|endpoint| endpoint.shared_context())
            .unwrap_or_default()
    }

    /// Answer a handshake request on the connection it came from.
    async fn respond(&self, conn: &Connection, request: &RpcRequest, result: Result<Value>) {
        let Some(reqid) = &request.reqid else {
            if let Err(e) = result {
                warn!("{} on connection {} failed: {}", request.command, conn.id, e);
            }
            return;
        };
        let response = Envelope::Response(RpcResponse {
            resid: reqid.clone(),
            route: request.source.clone(),
            source: Some(self.options.route.clone()),
            outcome: Some(Outcome::from(result)),
            close: true,
        });
        conn.send(&response).await;
    }

    // === Handshake ===

    async fn authenticate(&self, conn: &mut Connection, request: RpcRequest) {
        let route_id = format!(
            "{}:{}",
            RouterConfig::ISSUED_ROUTE_PREFIX,
            uuid::Uuid::new_v4()
        );
        info!("Issued route {} to connection {}", route_id, conn.id);
        let result = serde_json::to_value(CommandAuthenticateRtnData { route_id })
            .map_err(RpcError::from);
        self.respond(conn, &request, result).await;
    }

    async fn announce(&self, conn: &mut Connection, request: RpcRequest) {
        let result = self.register_announced(conn, &request);
        self.respond(conn, &request, result.map(|()| Value::Null))
            .await;
    }

    fn register_announced(&self, conn: &mut Connection, request: &RpcRequest) -> Result<()> {
        let data: CommandAnnounceData = decode_payload(command::ANNOUNCE, request.data.clone())?;
        let route = data.route_id;
        if route.is_empty() {
            return Err(RpcError::protocol("announce requires a routeid"));
        }
        if route == self.options.route {
            return Err(RpcError::DuplicateRoute { route });
        }

        let endpoint = Endpoint::new(conn.id, conn.outbound.clone(), data.ctx.clone());
        self.routes.register(route.clone(), endpoint.clone())?;
        if conn.route.is_none() {
            conn.route = Some(route.clone());
        }
        info!(
            "Route {} announced on connection {} ({:?})",
            route, conn.id, data.ctx.client_type
        );

        if let Some(alias) = data
            .ctx
            .client_type
            .and_then(|ctype| ctype.alias_route(&data.ctx))
        {
            match self.routes.register(alias.clone(), endpoint) {
                Ok(()) => info!("Alias {} -> {}", alias, route),
                Err(e) => warn!("Alias {} for {} skipped: {}", alias, route, e),
            }
        }
        Ok(())
    }

    // === Accessors ===

    /// The router's own route.
    pub fn route(&self) -> &str {
        &self.options.route
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    /// Handlers served by the router itself.
    pub fn handlers(&self) -> &HandlerRegistry {
        self.dispatcher.handlers()
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Publish an event from inside the router's process.
    pub fn publish(&self, event: &WaveEvent) -> PublishReport {
        self.events.publish(event, self)
    }
}

/// Drain a connection's routed queue into its transport. Ends once every
/// endpoint for the connection is gone or the transport closes.
async fn write_queued(
    id: ConnId,
    mut queued: mpsc::UnboundedReceiver<Bytes>,
    tx: mpsc::Sender<Bytes>,
) {
    while let Some(frame) = queued.recv().await {
        if tx.send(frame).await.is_err() {
            debug!("Connection {} transport closed, writer exiting", id);
            break;
        }
    }
}

impl EventDelivery for Router {
    fn deliver(&self, subscriber: &str, event: &WaveEvent) -> Result<()> {
        let endpoint = self.routes.lookup(subscriber)?;
        let envelope = Envelope::Request(RpcRequest {
            command: command::EVENT_RECV.to_string(),
            calltype: CallType::Call,
            reqid: None,
            source: Some(self.options.route.clone()),
            data: serde_json::to_value(event)?,
            opts: RpcOpts::default().to_route(subscriber).no_response(),
        });
        endpoint.send(&envelope)
    }
}

impl FrameAcceptor for Router {
    fn accept(self: &Arc<Self>, channel: FrameChannel, peer: String) -> Result<()> {
        self.attach(channel, peer).map(|_| ())
    }
}

/// Serve the event bus as commands on the router's own route.
fn register_event_handlers(router: &Arc<Router>) {
    let handlers = router.handlers();

    let weak = Arc::downgrade(router);
    handlers.register_call(command::EVENT_PUBLISH, move |ctx, mut event: WaveEvent| {
        let router = weak.upgrade();
        async move {
            let router = router.ok_or_else(|| anyhow::anyhow!("router is shut down"))?;
            if event.sender.is_empty() {
                if let Some(source) = ctx.source {
                    event.sender = source;
                }
            }
            router.publish(&event);
            anyhow::Ok(())
        }
    });

    let weak = Arc::downgrade(router);
    handlers.register_call(command::EVENT_SUB, move |ctx, request: SubscriptionRequest| {
        let router = weak.upgrade();
        async move {
            let router = router.ok_or_else(|| anyhow::anyhow!("router is shut down"))?;
            let route = ctx
                .source
                .ok_or_else(|| anyhow::anyhow!("eventsub requires an announced route"))?;
            router.events.subscribe(request, &route);
            anyhow::Ok(())
        }
    });

    let weak = Arc::downgrade(router);
    handlers.register_call(command::EVENT_UNSUB, move |ctx, event: String| {
        let router = weak.upgrade();
        async move {
            let router = router.ok_or_else(|| anyhow::anyhow!("router is shut down"))?;
            if let Some(route) = ctx.source {
                router.events.unsubscribe(&event, &route);
            }
            anyhow::Ok(())
        }
    });

    let weak = Arc::downgrade(router);
    handlers.register_call(command::EVENT_UNSUB_ALL, move |ctx, _: ()| {
        let router = weak.upgrade();
        async move {
            let router = router.ok_or_else(|| anyhow::anyhow!("router is shut down"))?;
            if let Some(route) = ctx.source {
                router.events.unsubscribe_all(&route);
            }
            anyhow::Ok(())
        }
    });

    let weak = Arc::downgrade(router);
    handlers.register_call(
        command::EVENT_READ_HISTORY,
        move |_ctx, request: CommandEventReadHistoryData| {
            let router = weak.upgrade();
            async move {
                let router = router.ok_or_else(|| anyhow::anyhow!("router is shut down"))?;
                anyhow::Ok(router.events.read_history(
                    &request.event,
                    &request.scope,
                    request.max_items,
                ))
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::ClientType;
    use serde_json::json;
    use std::time::Duration;

    /// Raw peer speaking envelopes over an in-process channel.
    struct RawPeer {
        channel: FrameChannel,
    }

    impl RawPeer {
        fn attach(router: &Arc<Router>) -> Self {
            Self {
                channel: router.connect_local().unwrap(),
            }
        }

        async fn send(&self, envelope: Envelope) {
            self.channel.tx.send(encode(&envelope).unwrap()).await.unwrap();
        }

        async fn send_raw(&self, frame: &'static [u8]) {
            self.channel.tx.send(Bytes::from_static(frame)).await.unwrap();
        }

        async fn recv(&mut self) -> Envelope {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.channel.rx.recv())
                .await
                .expect("frame in time")
                .expect("channel open");
            decode(&frame).unwrap()
        }

        async fn call(&mut self, command: &str, data: Value, route: Option<&str>) -> Result<Value> {
            let reqid = crate::dispatch::new_reqid();
            let mut opts = RpcOpts::default();
            opts.route = route.map(String::from);
            self.send(Envelope::Request(RpcRequest {
                command: command.to_string(),
                calltype: CallType::Call,
                reqid: Some(reqid.clone()),
                source: None,
                data,
                opts,
            }))
            .await;
            loop {
                if let Envelope::Response(r) = self.recv().await {
                    if r.resid == reqid {
                        return r.outcome.map(Outcome::into_result).unwrap_or(Ok(Value::Null));
                    }
                }
            }
        }

        async fn handshake(&mut self, ctx: RpcContext) -> String {
            let auth = self.call(command::AUTHENTICATE, Value::Null, None).await.unwrap();
            let route = auth["routeid"].as_str().unwrap().to_string();
            self.call(
                command::ANNOUNCE,
                json!({"routeid": route, "ctx": ctx}),
                None,
            )
            .await
            .unwrap();
            route
        }
    }

    fn started() -> Arc<Router> {
        let router = Router::new(RouterOptions::default());
        router.start();
        router
    }

    #[tokio::test]
    async fn test_attach_requires_start() {
        let router = Router::new(RouterOptions::default());
        assert!(router.connect_local().is_err());
        router.start();
        assert!(router.connect_local().is_ok());
    }

    #[tokio::test]
    async fn test_handshake_registers_route_and_alias() {
        let router = started();
        let mut peer = RawPeer::attach(&router);
        let route = peer.handshake(RpcContext::block_controller("b1")).await;

        assert!(route.starts_with("proc:"));
        assert!(router.routes().contains(&route));
        assert!(router.routes().contains("controller:b1"));
    }

    #[tokio::test]
    async fn test_duplicate_announce_fails() {
        let router = started();
        let mut a = RawPeer::attach(&router);
        let mut b = RawPeer::attach(&router);
        a.call(command::ANNOUNCE, json!({"routeid": "shared"}), None)
            .await
            .unwrap();
        let err = b
            .call(command::ANNOUNCE, json!({"routeid": "shared"}), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateRoute);
    }

    #[tokio::test]
    async fn test_alias_collision_is_skipped() {
        let router = started();
        let mut a = RawPeer::attach(&router);
        let mut b = RawPeer::attach(&router);
        let first = a.handshake(RpcContext::conn_server("ssh1")).await;
        let second = b.handshake(RpcContext::conn_server("ssh1")).await;

        assert!(router.routes().contains(&second));
        let alias = router.routes().lookup("conn:ssh1").unwrap();
        assert_eq!(router.routes().lookup(&first).unwrap(), alias);
    }

    #[tokio::test]
    async fn test_local_handler_sees_injected_context() {
        let router = started();
        router
            .handlers()
            .register_call(command::GET_META, |_ctx, req: crate::types::CommandGetMetaData| async move {
                Ok(json!({"oref": req.oref.to_string()}))
            });
        let mut peer = RawPeer::attach(&router);
        peer.handshake(RpcContext::block_controller("b7")).await;

        let meta = peer.call(command::GET_META, json!({}), None).await.unwrap();
        assert_eq!(meta, json!({"oref": "block:b7"}));
    }

    #[tokio::test]
    async fn test_forward_to_missing_route() {
        let router = started();
        let mut peer = RawPeer::attach(&router);
        peer.handshake(RpcContext::default()).await;

        let err = peer
            .call(command::GET_META, Value::Null, Some("controller:nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RouteNotFound);
        assert!(err.to_string().contains("controller:nope"));
    }

    #[tokio::test]
    async fn test_unannounced_peer_cannot_forward() {
        let router = started();
        let mut peer = RawPeer::attach(&router);
        let err = peer
            .call(command::GET_META, Value::Null, Some("anywhere"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_forward_stamps_source_and_keeps_payload() {
        let router = started();
        let mut caller = RawPeer::attach(&router);
        let mut target = RawPeer::attach(&router);
        let caller_route = caller.handshake(RpcContext::default()).await;
        target.handshake(RpcContext::block_controller("b2")).await;

        caller
            .send(Envelope::Request(RpcRequest {
                command: command::GET_META.into(),
                calltype: CallType::Call,
                reqid: Some("fwd-1".into()),
                source: None,
                data: json!({}),
                opts: RpcOpts::default().to_route("controller:b2"),
            }))
            .await;

        match target.recv().await {
            Envelope::Request(req) => {
                assert_eq!(req.source.as_deref(), Some(caller_route.as_str()));
                assert_eq!(req.data, json!({}));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_answered_when_reqid_recoverable() {
        let router = started();
        let mut peer = RawPeer::attach(&router);
        peer.send_raw(br#"{"type":"request","command":"x","calltype":"sideways","reqid":"bad-1"}"#)
            .await;
        match peer.recv().await {
            Envelope::Response(r) => {
                assert_eq!(r.resid, "bad-1");
                assert!(r.close);
                assert!(matches!(
                    r.outcome,
                    Some(Outcome::Error(ref e)) if e.kind == ErrorKind::ProtocolViolation
                ));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_releases_routes_and_subscriptions() {
        let router = started();
        let mut peer = RawPeer::attach(&router);
        let route = peer.handshake(RpcContext::block_controller("b3")).await;
        peer.call(
            command::EVENT_SUB,
            serde_json::to_value(SubscriptionRequest::all("blockclose")).unwrap(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(router.events().subscriptions_of(&route).len(), 1);

        drop(peer);
        tokio::time::timeout(Duration::from_secs(2), async {
            while router.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(!router.routes().contains(&route));
        assert!(!router.routes().contains("controller:b3"));
        assert!(router.events().subscriptions_of(&route).is_empty());
    }

    #[tokio::test]
    async fn test_stop_clears_state() {
        let router = started();
        let mut peer = RawPeer::attach(&router);
        peer.handshake(RpcContext::conn_server("c1")).await;
        assert_eq!(router.routes().len(), 2);

        router.stop();
        assert!(!router.is_running());
        assert!(router.routes().is_empty());
        assert!(router.connect_local().is_err());
    }

    #[tokio::test]
    async fn test_event_delivered_as_eventrecv() {
        let router = started();
        let mut subscriber = RawPeer::attach(&router);
        let route = subscriber.handshake(RpcContext::default()).await;
        subscriber
            .call(
                command::EVENT_SUB,
                serde_json::to_value(SubscriptionRequest::scoped("connchange", ["ssh1"])).unwrap(),
                None,
            )
            .await
            .unwrap();

        let report = router.publish(&WaveEvent::new("connchange").with_scopes(["ssh1"]));
        assert_eq!(report.delivered, 1);

        match subscriber.recv().await {
            Envelope::Request(req) => {
                assert_eq!(req.command, command::EVENT_RECV);
                assert!(req.reqid.is_none());
                assert!(req.opts.noresponse);
                assert_eq!(req.opts.route.as_deref(), Some(route.as_str()));
                let event: WaveEvent = serde_json::from_value(req.data).unwrap();
                assert_eq!(event.event, "connchange");
            }
            other => panic!("expected eventrecv, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_other_calls() {
        let router = started();

        // Announces a route and then never reads its channel.
        let mut stalled = RawPeer::attach(&router);
        stalled
            .call(command::ANNOUNCE, json!({"routeid": "slow"}), None)
            .await
            .unwrap();

        let healthy = crate::client::RpcClient::new(router.connect_local().unwrap());
        healthy
            .handlers()
            .register_call("test", |_ctx, v: Value| async move { Ok(v) });
        let healthy_route = healthy.connect(RpcContext::default()).await.unwrap();

        let mut sender = RawPeer::attach(&router);
        sender.handshake(RpcContext::default()).await;
        let flood = router.options().frame_queue_size + 44;
        for n in 0..flood {
            sender
                .send(Envelope::Request(RpcRequest {
                    command: command::MESSAGE.into(),
                    calltype: CallType::Call,
                    reqid: None,
                    source: None,
                    data: json!({"n": n}),
                    opts: RpcOpts::default().to_route("slow").no_response(),
                }))
                .await;
        }

        let reply = tokio::time::timeout(
            Duration::from_secs(2),
            sender.call("test", json!("still here"), Some(&healthy_route)),
        )
        .await
        .expect("call not stalled behind the slow peer")
        .unwrap();
        assert_eq!(reply, json!("still here"));
        drop(stalled);
    }

    #[test]
    fn test_client_type_alias_shapes() {
        let ctx = RpcContext::block_controller("b1");
        assert_eq!(
            ClientType::BlockController.alias_route(&ctx).as_deref(),
            Some("controller:b1")
        );
    }
}
