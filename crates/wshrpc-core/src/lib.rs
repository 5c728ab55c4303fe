//! wshrpc Core - Routed RPC substrate for a multi-process application.
//!
//! Processes (block controllers, connection servers, UI clients) connect to a
//! central router over framed channels. Each connection announces one or more
//! routes; requests addressed to a route are forwarded to the connection that
//! owns it, requests without a route are served by the router itself.
//!
//! The crate provides:
//!
//! - the envelope codec (`wire`)
//! - context injection of omitted addressing fields (`context`)
//! - the route table (`routes`)
//! - call dispatch for the four call types (`dispatch`)
//! - scoped publish/subscribe with bounded history (`events`)
//! - the router and its process-side client (`router`, `client`)
//!
//! # Example
//!
//! ```rust,ignore
//! use wshrpc_core::{Router, RouterOptions, RpcClient, RpcContext, RpcOpts};
//!
//! #[tokio::main]
//! async fn main() -> wshrpc_core::Result<()> {
//!     let router = Router::new(RouterOptions::default());
//!     router.start();
//!
//!     let controller = RpcClient::new(router.connect_local()?);
//!     controller.handlers().register_call("getmeta", |ctx, data: serde_json::Value| async move {
//!         anyhow::Ok(serde_json::json!({"caller": ctx.source, "req": data}))
//!     });
//!     let route = controller.connect(RpcContext::block_controller("b1")).await?;
//!
//!     let ui = RpcClient::new(router.connect_local()?);
//!     ui.connect(RpcContext::default()).await?;
//!     let meta: serde_json::Value = ui
//!         .call("getmeta", serde_json::json!({}), RpcOpts::default().to_route(route))
//!         .await?;
//!     println!("{meta}");
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod ipc;
pub mod router;
pub mod routes;
pub mod types;
pub mod wire;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use client::RpcClient;
pub use config::{EventConfig, RouterConfig, RouterOptions};
pub use context::{BindingTable, ContextBound, FieldBinding};
pub use dispatch::{
    ComplexCall, Dispatcher, HandlerContext, HandlerRegistry, RequestSender, RequestStream,
    ResponseSink, ResponseStream, StreamingRequestCall,
};
pub use error::{ErrorKind, Result, RpcError, WireError};
pub use events::{EventBus, EventDelivery, PublishReport, Subscription};
pub use ipc::{FrameChannel, IpcServerHandle};
pub use router::Router;
pub use routes::{ConnId, Endpoint, RouteTable};
pub use types::{ClientType, ORef, RpcContext, SubscriptionRequest, WaveEvent};
pub use wire::{CallType, Envelope, RpcOpts};
