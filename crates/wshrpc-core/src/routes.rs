//! Route table: which logical route is served by which live connection.
//!
//! The table is the single source of truth for reachability. Every forwarding
//! decision and every event delivery looks the destination up here; a route is
//! present exactly while the connection that announced it is open.

use crate::error::{Result, RpcError};
use crate::types::RpcContext;
use crate::wire::{encode, Envelope};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Router-local identifier of one transport connection.
pub type ConnId = u64;

/// A live, addressable destination: the outbound queue of a connection plus
/// the routing context announced for the route.
///
/// The queue is unbounded and drained by the connection's writer task, so
/// queueing never waits on the destination peer.
#[derive(Debug, Clone)]
pub struct Endpoint {
    conn_id: ConnId,
    tx: mpsc::UnboundedSender<Bytes>,
    ctx: Arc<RpcContext>,
}

impl Endpoint {
    pub fn new(conn_id: ConnId, tx: mpsc::UnboundedSender<Bytes>, ctx: RpcContext) -> Self {
        Self {
            conn_id,
            tx,
            ctx: Arc::new(ctx),
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn context(&self) -> &RpcContext {
        &self.ctx
    }

    pub fn shared_context(&self) -> Arc<RpcContext> {
        self.ctx.clone()
    }

    /// Queue an envelope for the connection's writer.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let frame = encode(envelope)?;
        self.tx.send(frame).map_err(|_| RpcError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.conn_id == other.conn_id && self.tx.same_channel(&other.tx) && self.ctx == other.ctx
    }
}

/// Bidirectional map between routes and live endpoints.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, Endpoint>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route. Fails with `DuplicateRoute` if it is already live.
    pub fn register(&self, route: impl Into<String>, endpoint: Endpoint) -> Result<()> {
        let route = route.into();
        if route.is_empty() {
            return Err(RpcError::protocol("cannot register an empty route"));
        }
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        match routes.entry(route) {
            std::collections::hash_map::Entry::Occupied(entry) => Err(RpcError::DuplicateRoute {
                route: entry.key().clone(),
            }),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(endpoint);
                Ok(())
            }
        }
    }

    /// Look up the endpoint serving `route`.
    pub fn lookup(&self, route: &str) -> Result<Endpoint> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(route)
            .cloned()
            .ok_or_else(|| RpcError::route_not_found(route))
    }

    pub fn contains(&self, route: &str) -> bool {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(route)
    }

    /// Remove a route. Removing an absent route is a no-op.
    pub fn unregister(&self, route: &str) -> Option<Endpoint> {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(route)
    }

    /// Remove every route served by `conn_id`, returning the removed routes.
    pub fn unregister_connection(&self, conn_id: ConnId) -> Vec<String> {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let owned: Vec<String> = routes
            .iter()
            .filter(|(_, ep)| ep.conn_id == conn_id)
            .map(|(route, _)| route.clone())
            .collect();
        for route in &owned {
            routes.remove(route);
        }
        owned
    }

    /// Routes currently owned by `conn_id`.
    pub fn routes_for(&self, conn_id: ConnId) -> Vec<String> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, ep)| ep.conn_id == conn_id)
            .map(|(route, _)| route.clone())
            .collect()
    }

    /// All live routes.
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        routes.sort();
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
