//! HTTP bridge server implementation using Axum.

use crate::handler::{handle_health, handle_rpc, RpcDispatch};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use wshrpc_core::RouterConfig;

/// Application state shared across handlers.
pub struct AppState {
    /// The router this process hosts.
    pub router: Arc<wshrpc_core::Router>,
    /// Executes bridged calls; normally an in-process client of `router`.
    pub gateway: Arc<dyn RpcDispatch>,
}

/// Start the HTTP bridge.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(state: AppState, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let state = Arc::new(state);

    // Configure CORS for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/rpc", post(handle_rpc))
        .layer(ConcurrencyLimitLayer::new(RouterConfig::MAX_CONNECTIONS))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("HTTP bridge listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP bridge error: {}", e);
        }
    });

    Ok(actual_addr)
}
