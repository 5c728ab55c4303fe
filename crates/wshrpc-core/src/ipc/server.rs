//! TCP listener for remote peers.
//!
//! Accepts connections on a local address and hands each one, bridged into a
//! `FrameChannel`, to a `FrameAcceptor` (normally the `Router`).
//!
//! # Thread Safety
//!
//! The accept loop runs on its own task. Each accepted connection is served by
//! the bridge tasks of its frame channel; the acceptor is shared via `Arc`.

use super::channel::{bridge, FrameChannel};
use crate::config::RouterConfig;
use crate::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running listener. Dropping shuts it down.
pub struct IpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl IpcServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting new connections and close the active ones.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Receiver of newly accepted transports.
pub trait FrameAcceptor: Send + Sync + 'static {
    /// Take ownership of a connected frame channel.
    fn accept(self: &Arc<Self>, channel: FrameChannel, peer: String) -> Result<()>;
}

/// Decrements the live connection count when the transport closes.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// TCP listener for frame transports.
pub struct IpcServer;

impl IpcServer {
    /// Start listening on `addr` (use port 0 for an OS-assigned port).
    pub async fn start<A: FrameAcceptor>(acceptor: Arc<A>, addr: SocketAddr) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("Frame listener on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            acceptor,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(IpcServerHandle {
            addr,
            port,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<A: FrameAcceptor>(
        listener: TcpListener,
        acceptor: Arc<A>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Frame listener shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= RouterConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    RouterConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let slot = ConnectionSlot(active_connections.clone());
                            let (reader, writer) = stream.into_split();
                            let peer = peer_addr.to_string();
                            let channel = bridge(
                                reader,
                                writer,
                                peer.clone(),
                                Some(conn_shutdown_rx.clone()),
                                slot,
                            );

                            debug!("Connection from {}", peer);
                            if let Err(e) = acceptor.accept(channel, peer.clone()) {
                                warn!("Connection from {} refused: {}", peer, e);
                            }
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }
}
