//! Centralized configuration for the RPC substrate.
//!
//! Fixed limits live in const-only structs; per-router knobs live in
//! `RouterOptions`.

use std::time::Duration;

/// Router and transport limits.
pub struct RouterConfig;

impl RouterConfig {
    /// Route the router answers to when no explicit one is configured.
    pub const DEFAULT_ROUTE: &'static str = "router";
    /// Prefix for routes issued by `authenticate`.
    pub const ISSUED_ROUTE_PREFIX: &'static str = "proc";
    /// Largest frame accepted from a byte transport.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Maximum concurrent peers on one TCP listener.
    pub const MAX_CONNECTIONS: usize = 256;
    /// Per-call buffer between a streaming handler and its connection.
    pub const STREAM_BUFFER_SIZE: usize = 32;
    /// Frames queued per direction on one connection.
    pub const FRAME_QUEUE_SIZE: usize = 256;
    /// Timeout for opening a TCP transport.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    /// Timeout the client uses for handshake commands.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Event bus limits.
pub struct EventConfig;

impl EventConfig {
    /// Upper bound on retained history per (event, scope).
    pub const MAX_PERSIST: usize = 4096;
    /// Capacity of each local listener channel on a client.
    pub const LISTENER_CHANNEL_SIZE: usize = 64;
}

/// Runtime options for one router instance.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// The router's own route; envelopes addressed here are handled locally.
    pub route: String,
    /// Per-call response buffer for streaming handlers.
    pub stream_buffer_size: usize,
    /// Frames queued towards each connection.
    pub frame_queue_size: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            route: RouterConfig::DEFAULT_ROUTE.to_string(),
            stream_buffer_size: RouterConfig::STREAM_BUFFER_SIZE,
            frame_queue_size: RouterConfig::FRAME_QUEUE_SIZE,
        }
    }
}

impl RouterOptions {
    /// Use a different own route.
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    /// Use a different per-call stream buffer.
    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size.max(1);
        self
    }
}
