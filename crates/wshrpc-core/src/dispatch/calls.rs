//! Caller-side call state: pending calls and the handles of streaming calls.
//!
//! Every outbound call that expects responses registers an unbounded queue
//! under its `reqid`. The connection reader pushes response elements into it
//! and drops the queue when a `close` response arrives, so a slow consumer
//! never stalls the reader shared by other calls.

use crate::error::{Result, RpcError};
use crate::wire::{encode, Envelope, RpcCancel, RpcFragment, RpcResponse};
use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// New correlation id for an outbound call.
pub fn new_reqid() -> String {
    uuid::Uuid::new_v4().to_string()
}

type ElementTx = mpsc::UnboundedSender<Result<Value>>;
type ElementRx = mpsc::UnboundedReceiver<Result<Value>>;

/// Outbound calls awaiting responses, keyed by reqid.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, ElementTx>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `reqid`; returns the queue its responses land in.
    pub fn register(&self, reqid: &str) -> ElementRx {
        let (tx, rx) = mpsc::unbounded_channel();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(reqid.to_string(), tx);
        rx
    }

    /// Stop tracking `reqid`. Returns false when it was not pending.
    pub fn remove(&self, reqid: &str) -> bool {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(reqid)
            .is_some()
    }

    pub fn contains(&self, reqid: &str) -> bool {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(reqid)
    }

    /// Route one response element to its call. Returns false for unknown calls.
    pub fn deliver(&self, response: RpcResponse) -> bool {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = calls.get(&response.resid) else {
            debug!("Dropping response for unknown call {}", response.resid);
            return false;
        };
        if let Some(outcome) = response.outcome {
            let _ = tx.send(outcome.into_result());
        }
        if response.close {
            calls.remove(&response.resid);
        }
        true
    }

    /// Fail every pending call with an error built by `err`.
    pub fn fail_all(&self, err: impl Fn() -> RpcError) {
        let drained: Vec<(String, ElementTx)> = self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(err()));
        }
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a call handle needs to talk back to the handler side.
#[derive(Debug, Clone)]
pub(crate) struct CallLink {
    pub(crate) reqid: String,
    /// Destination of the original request; `None` addresses the router.
    pub(crate) route: Option<String>,
    pub(crate) tx: mpsc::Sender<Bytes>,
    pub(crate) pending: Arc<PendingCalls>,
}

impl CallLink {
    /// Best-effort cancel envelope; never waits.
    fn send_cancel(&self) {
        let envelope = Envelope::Cancel(RpcCancel {
            reqid: self.reqid.clone(),
            route: self.route.clone(),
            source: None,
        });
        let sent = encode(&envelope).and_then(|frame| {
            self.tx
                .try_send(frame)
                .map_err(|_| RpcError::Disconnected)
        });
        if let Err(e) = sent {
            debug!("Cancel for {} not sent: {}", self.reqid, e);
        }
    }

    async fn send_fragment(&self, data: Option<Value>, close: bool) -> Result<()> {
        let envelope = Envelope::Fragment(RpcFragment {
            reqid: self.reqid.clone(),
            route: self.route.clone(),
            source: None,
            data,
            close,
        });
        let frame = encode(&envelope)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| RpcError::Disconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Closed,
    Cancelled,
}

/// Response side of a streaming call.
///
/// Yields each response element in order; ends when the handler closes the
/// stream. Non-fatal handler errors appear as `Err` items without ending the
/// stream. Dropping an unfinished stream cancels the call.
#[derive(Debug)]
pub struct ResponseStream {
    link: CallLink,
    rx: ElementRx,
    state: StreamState,
}

impl ResponseStream {
    pub(crate) fn new(link: CallLink, rx: ElementRx) -> Self {
        Self {
            link,
            rx,
            state: StreamState::Open,
        }
    }

    pub fn reqid(&self) -> &str {
        &self.link.reqid
    }

    /// Cancel the call. No element is observed after this returns; the handler
    /// side is told to stop on a best-effort basis.
    pub fn cancel(&mut self) {
        if self.state == StreamState::Cancelled {
            return;
        }
        self.state = StreamState::Cancelled;
        self.rx.close();
        if self.link.pending.remove(&self.link.reqid) {
            self.link.send_cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == StreamState::Cancelled
    }

    /// Next element, `None` once closed or cancelled.
    pub async fn recv(&mut self) -> Option<Result<Value>> {
        if self.state != StreamState::Open {
            return None;
        }
        let item = self.rx.recv().await;
        if item.is_none() {
            self.state = StreamState::Closed;
        }
        item
    }

    /// Next element decoded as `T`.
    pub async fn recv_as<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        let item = self.recv().await?;
        Some(item.and_then(|v| serde_json::from_value(v).map_err(RpcError::from)))
    }

    /// Stop tracking the call without telling the handler side.
    fn release(&mut self) {
        self.state = StreamState::Closed;
        self.rx.close();
        self.link.pending.remove(&self.link.reqid);
    }
}

impl Stream for ResponseStream {
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.state != StreamState::Open {
            return Poll::Ready(None);
        }
        let polled = this.rx.poll_recv(cx);
        if let Poll::Ready(None) = polled {
            this.state = StreamState::Closed;
        }
        polled
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if self.state == StreamState::Open && self.link.pending.contains(&self.link.reqid) {
            self.cancel();
        }
    }
}

/// Request side of a streaming-request or complex call.
///
/// Dropping an unclosed sender closes the request side.
#[derive(Debug)]
pub struct RequestSender {
    link: CallLink,
    closed: bool,
}

impl RequestSender {
    pub(crate) fn new(link: CallLink) -> Self {
        Self {
            link,
            closed: false,
        }
    }

    pub fn reqid(&self) -> &str {
        &self.link.reqid
    }

    /// Send one request fragment.
    pub async fn send<T: Serialize>(&mut self, item: T) -> Result<()> {
        if self.closed {
            return Err(RpcError::protocol("request side already closed"));
        }
        let value = serde_json::to_value(item)?;
        self.link.send_fragment(Some(value), false).await
    }

    /// Close the request side. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.link.send_fragment(None, true).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for RequestSender {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let envelope = Envelope::Fragment(RpcFragment {
            reqid: self.link.reqid.clone(),
            route: self.link.route.clone(),
            source: None,
            data: None,
            close: true,
        });
        if let Ok(frame) = encode(&envelope) {
            let _ = self.link.tx.try_send(frame);
        }
    }
}

/// A streaming-request call: send fragments, then wait for the single result.
#[derive(Debug)]
pub struct StreamingRequestCall {
    requests: RequestSender,
    response: ResponseStream,
    timeout: Option<Duration>,
    opened: Instant,
}

impl StreamingRequestCall {
    pub(crate) fn new(
        requests: RequestSender,
        response: ResponseStream,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            requests,
            response,
            timeout,
            opened: Instant::now(),
        }
    }

    pub fn reqid(&self) -> &str {
        self.requests.reqid()
    }

    pub async fn send<T: Serialize>(&mut self, item: T) -> Result<()> {
        self.requests.send(item).await
    }

    /// Close the request side and wait for the result.
    ///
    /// The timeout counts from when the call was opened. Timing out releases
    /// the call but leaves the handler running.
    pub async fn finish(mut self) -> Result<Value> {
        self.requests.close().await?;
        let result = match self.timeout {
            Some(timeout) => {
                let deadline = self.opened + timeout;
                match tokio::time::timeout_at(deadline, self.response.recv()).await {
                    Ok(item) => item,
                    Err(_) => {
                        self.response.release();
                        return Err(RpcError::TimedOut(timeout));
                    }
                }
            }
            None => self.response.recv().await,
        };
        self.response.release();
        result.unwrap_or_else(|| Err(RpcError::protocol("call closed without a result")))
    }

    pub fn cancel(&mut self) {
        self.requests.closed = true;
        self.response.cancel();
    }
}

/// A complex call: both sides stream independently.
///
/// The fields can be moved apart to drive each side from its own task; closing
/// the request side leaves the response side open and vice versa.
#[derive(Debug)]
pub struct ComplexCall {
    pub requests: RequestSender,
    pub responses: ResponseStream,
}

impl ComplexCall {
    pub fn reqid(&self) -> &str {
        self.requests.reqid()
    }

    pub fn cancel(&mut self) {
        self.requests.closed = true;
        self.responses.cancel();
    }
}
