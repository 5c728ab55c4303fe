//! Envelope encoding.
//!
//! Frames are UTF-8 JSON documents. The codec does no I/O: transports hand it
//! complete frames and get complete frames back.

use super::Envelope;
use crate::error::{Result, RpcError};
use bytes::Bytes;

/// Encode an envelope into a transport frame.
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    let bytes = serde_json::to_vec(envelope)?;
    Ok(Bytes::from(bytes))
}

/// Decode and validate a transport frame.
///
/// Fails with `ProtocolViolation` on malformed JSON, an unknown envelope or
/// call type tag, or a request with an empty command.
pub fn decode(frame: &[u8]) -> Result<Envelope> {
    let envelope: Envelope = serde_json::from_slice(frame)
        .map_err(|e| RpcError::protocol(format!("malformed envelope: {}", e)))?;
    validate(&envelope)?;
    Ok(envelope)
}

fn validate(envelope: &Envelope) -> Result<()> {
    match envelope {
        Envelope::Request(req) if req.command.trim().is_empty() => {
            Err(RpcError::protocol("request has an empty command"))
        }
        Envelope::Request(req) if req.opts.noresponse && req.reqid.is_some() => Err(
            RpcError::protocol("noresponse request must not carry a reqid"),
        ),
        Envelope::Fragment(f) if f.reqid.is_empty() => {
            Err(RpcError::protocol("fragment has an empty reqid"))
        }
        Envelope::Response(r) if r.resid.is_empty() => {
            Err(RpcError::protocol("response has an empty resid"))
        }
        Envelope::Cancel(c) if c.reqid.is_empty() => {
            Err(RpcError::protocol("cancel has an empty reqid"))
        }
        _ => Ok(()),
    }
}

/// Best-effort recovery of the correlation id of a frame that failed to
/// decode, so the violation can be reported back to the caller.
pub fn salvage_reqid(frame: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(frame).ok()?;
    if value.get("type").and_then(|t| t.as_str()) != Some("request") {
        return None;
    }
    value
        .get("reqid")
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .map(String::from)
}
