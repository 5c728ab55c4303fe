//! Error types for the RPC substrate.
//!
//! Every failure the router, dispatcher or event bus can report maps onto one
//! `RpcError` variant. Errors cross the wire as a `WireError` carrying the
//! `ErrorKind` tag and the display message, so a caller on another process sees
//! the same kind the router produced.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for wshrpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    // Protocol errors
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("Unknown command: {command}")]
    UnknownCommand { command: String },

    #[error("Invalid context binding {binding:?} for field {field:?}")]
    InvalidBinding { binding: String, field: String },

    // Routing errors
    #[error("Route already registered: {route}")]
    DuplicateRoute { route: String },

    #[error("Route not found: {route}")]
    RouteNotFound { route: String },

    // Call errors
    #[error("{message}")]
    HandlerError { message: String },

    #[error("Request timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Call cancelled")]
    Cancelled,

    // Transport errors
    #[error("Connection closed")]
    Disconnected,

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for wshrpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Wire-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    ProtocolViolation,
    UnknownCommand,
    InvalidBinding,
    DuplicateRoute,
    RouteNotFound,
    HandlerError,
    TimedOut,
    Cancelled,
    Disconnected,
    Internal,
}

/// Error as carried inside a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<crate::cancel::CancelledError> for RpcError {
    fn from(_: crate::cancel::CancelledError) -> Self {
        RpcError::Cancelled
    }
}

impl RpcError {
    /// Create a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Create a route-not-found error.
    pub fn route_not_found(route: impl Into<String>) -> Self {
        RpcError::RouteNotFound {
            route: route.into(),
        }
    }

    /// Wrap a handler-reported failure, keeping its message untouched.
    pub fn handler(err: &anyhow::Error) -> Self {
        RpcError::HandlerError {
            message: err.to_string(),
        }
    }

    /// Classify this error for the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::ProtocolViolation { .. } | RpcError::Json { .. } => {
                ErrorKind::ProtocolViolation
            }
            RpcError::UnknownCommand { .. } => ErrorKind::UnknownCommand,
            RpcError::InvalidBinding { .. } => ErrorKind::InvalidBinding,
            RpcError::DuplicateRoute { .. } => ErrorKind::DuplicateRoute,
            RpcError::RouteNotFound { .. } => ErrorKind::RouteNotFound,
            RpcError::HandlerError { .. } => ErrorKind::HandlerError,
            RpcError::TimedOut(_) => ErrorKind::TimedOut,
            RpcError::Cancelled => ErrorKind::Cancelled,
            RpcError::Disconnected => ErrorKind::Disconnected,
            RpcError::Io { .. } | RpcError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Convert to the wire representation.
    pub fn to_wire(&self) -> WireError {
        let message = match self {
            // The remote side rebuilds the variant from the bare field.
            RpcError::ProtocolViolation { message } | RpcError::HandlerError { message } => {
                message.clone()
            }
            RpcError::UnknownCommand { command } => command.clone(),
            RpcError::DuplicateRoute { route } | RpcError::RouteNotFound { route } => route.clone(),
            RpcError::TimedOut(d) => d.as_millis().to_string(),
            other => other.to_string(),
        };
        WireError {
            kind: self.kind(),
            message,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32601: Method not found
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Handler reported failure
    /// - -32001: Route not found
    /// - -32002: Duplicate route
    /// - -32003: Timed out
    /// - -32004: Cancelled
    /// - -32005: Connection lost
    pub fn to_rpc_error_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::ProtocolViolation => -32700,
            ErrorKind::UnknownCommand => -32601,
            ErrorKind::HandlerError => -32000,
            ErrorKind::RouteNotFound => -32001,
            ErrorKind::DuplicateRoute => -32002,
            ErrorKind::TimedOut => -32003,
            ErrorKind::Cancelled => -32004,
            ErrorKind::Disconnected => -32005,
            ErrorKind::InvalidBinding | ErrorKind::Internal => -32603,
        }
    }
}

impl From<WireError> for RpcError {
    fn from(err: WireError) -> Self {
        let WireError { kind, message } = err;
        match kind {
            ErrorKind::ProtocolViolation => RpcError::ProtocolViolation { message },
            ErrorKind::UnknownCommand => RpcError::UnknownCommand { command: message },
            ErrorKind::InvalidBinding => RpcError::InvalidBinding {
                binding: message,
                field: String::new(),
            },
            ErrorKind::DuplicateRoute => RpcError::DuplicateRoute { route: message },
            ErrorKind::RouteNotFound => RpcError::RouteNotFound { route: message },
            ErrorKind::HandlerError => RpcError::HandlerError { message },
            ErrorKind::TimedOut => {
                RpcError::TimedOut(Duration::from_millis(message.parse().unwrap_or(0)))
            }
            ErrorKind::Cancelled => RpcError::Cancelled,
            ErrorKind::Disconnected => RpcError::Disconnected,
            ErrorKind::Internal => RpcError::Other(message),
        }
    }
}
