//! Wire-level message shapes.
//!
//! Four envelope kinds travel over every transport:
//!
//! - `request`: opens a call (`command`, `calltype`, `data`, `opts`)
//! - `fragment`: one more request element for streaming-request/complex calls
//! - `response`: one result-or-error element; `close` ends the response side
//! - `cancel`: asks the handler side of a call to stop producing
//!
//! `reqid` correlates everything that belongs to one call. Responses carry it
//! back as `resid`. `route` is the destination, `source` the sender's route.

pub mod codec;

use crate::error::{RpcError, WireError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub use codec::{decode, encode, salvage_reqid};

/// Shape of a call: how many elements flow in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Single request, single result.
    Call,
    /// Single request, stream of results.
    ResponseStream,
    /// Stream of request fragments, single result.
    StreamingRequest,
    /// Both directions stream independently.
    Complex,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Call => "call",
            CallType::ResponseStream => "responsestream",
            CallType::StreamingRequest => "streamingrequest",
            CallType::Complex => "complex",
        }
    }

    /// True when the handler may send more than one response element.
    pub fn streams_responses(&self) -> bool {
        matches!(self, CallType::ResponseStream | CallType::Complex)
    }

    /// True when the caller may send request fragments after the request.
    pub fn streams_requests(&self) -> bool {
        matches!(self, CallType::StreamingRequest | CallType::Complex)
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Caller-supplied request options.
///
/// Input only: the cancel handle of a streaming call is returned next to the
/// request, never stored here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcOpts {
    /// Timeout in milliseconds; 0 waits indefinitely.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub noresponse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl RpcOpts {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn to_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn no_response(mut self) -> Self {
        self.noresponse = true;
        self
    }

    /// The timeout as a duration, `None` when unset.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(self.timeout))
    }

    fn is_default(&self) -> bool {
        self == &RpcOpts::default()
    }
}

/// Opens a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub command: String,
    pub calltype: CallType,
    /// Correlation id; absent for `noresponse` calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "RpcOpts::is_default")]
    pub opts: RpcOpts,
}

/// One additional request element of a streaming call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcFragment {
    pub reqid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// `Some(Value::Null)` is an explicit null element, `None` no element.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub data: Option<Value>,
    /// No more fragments follow.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub close: bool,
}

/// Reads a field that is on the wire as `Some`, including an explicit null.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Result-or-error element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Value(Value),
    Error(WireError),
}

impl Outcome {
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Error(e) => Err(e.into()),
        }
    }
}

impl From<Result<Value, RpcError>> for Outcome {
    fn from(result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(v) => Outcome::Value(v),
            Err(e) => Outcome::Error(e.to_wire()),
        }
    }
}

/// One response element; `close` ends the response side of the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub resid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub close: bool,
}

/// Asks the handler side to stop producing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCancel {
    pub reqid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Anything that travels over a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Request(RpcRequest),
    Fragment(RpcFragment),
    Response(RpcResponse),
    Cancel(RpcCancel),
}

impl Envelope {
    /// Destination route, if the envelope is addressed.
    pub fn destination(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => r.opts.route.as_deref(),
            Envelope::Fragment(f) => f.route.as_deref(),
            Envelope::Response(r) => r.route.as_deref(),
            Envelope::Cancel(c) => c.route.as_deref(),
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => r.source.as_deref(),
            Envelope::Fragment(f) => f.source.as_deref(),
            Envelope::Response(r) => r.source.as_deref(),
            Envelope::Cancel(c) => c.source.as_deref(),
        }
    }

    /// Stamp the sender route unless the envelope already names one.
    pub fn stamp_source(&mut self, route: &str) {
        let slot = match self {
            Envelope::Request(r) => &mut r.source,
            Envelope::Fragment(f) => &mut f.source,
            Envelope::Response(r) => &mut r.source,
            Envelope::Cancel(c) => &mut c.source,
        };
        if slot.as_deref().map_or(true, str::is_empty) {
            *slot = Some(route.to_string());
        }
    }

    /// Correlation id of the call this envelope belongs to.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => r.reqid.as_deref(),
            Envelope::Fragment(f) => Some(&f.reqid),
            Envelope::Response(r) => Some(&r.resid),
            Envelope::Cancel(c) => Some(&c.reqid),
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Request(_) => "request",
            Envelope::Fragment(_) => "fragment",
            Envelope::Response(_) => "response",
            Envelope::Cancel(_) => "cancel",
        }
    }
}

/// Build the error response that fails call `resid`.
pub fn error_response(resid: &str, route: Option<String>, err: &RpcError) -> Envelope {
    Envelope::Response(RpcResponse {
        resid: resid.to_string(),
        route,
        source: None,
        outcome: Some(Outcome::Error(err.to_wire())),
        close: true,
    })
}
