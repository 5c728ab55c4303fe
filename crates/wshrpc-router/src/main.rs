//! wshrpc Router - hub process for routed RPC.
//!
//! Accepts framed TCP connections from peer processes, serves the router's own
//! commands and optionally exposes a JSON-RPC HTTP bridge.

mod handler;
mod handlers;
mod server;

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use wshrpc_core::{Router, RouterConfig, RouterOptions, RpcClient, RpcContext};

#[derive(Parser, Debug)]
#[command(name = "wshrpc-router")]
#[command(about = "Routed RPC hub")]
struct Args {
    /// Frame listener port (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// HTTP bridge port (0 = auto-assign); the bridge is off when omitted
    #[arg(long)]
    http_port: Option<u16>,

    /// Route the router answers on
    #[arg(long, default_value = RouterConfig::DEFAULT_ROUTE)]
    route: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting wshrpc router");

    let router = Router::new(RouterOptions::default().with_route(args.route));
    handlers::register(router.handlers(), Arc::new(handlers::MetaStore::default()));
    router.start();

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let mut listener = router.serve_tcp(addr).await?;

    // Ports are printed for the parent process to read (intentional stdout)
    println!("RPC_PORT={}", listener.addr().port());

    if let Some(http_port) = args.http_port {
        let gateway = RpcClient::new(router.connect_local()?);
        gateway.connect(RpcContext::default()).await?;
        let state = server::AppState {
            router: router.clone(),
            gateway: Arc::new(gateway),
        };
        let http_addr = server::start_server(state, &args.host, http_port).await?;
        println!("HTTP_PORT={}", http_addr.port());
    }

    info!("Router {:?} listening on {}", router.route(), listener.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    listener.shutdown();
    router.stop();

    Ok(())
}
