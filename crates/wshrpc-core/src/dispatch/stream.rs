//! Handler-side ends of streaming calls.

use crate::cancel::CancellationToken;
use crate::error::{Result, RpcError};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Where a streaming handler writes its response elements.
///
/// Backed by a bounded per-call queue: `send` suspends while the queue is full.
/// Once the caller cancels, every send fails with `Cancelled`. The response
/// stream closes when the handler returns and all clones of the sink are
/// dropped.
#[derive(Debug, Clone)]
pub struct ResponseSink {
    tx: mpsc::Sender<Result<Value>>,
    cancel: CancellationToken,
}

impl ResponseSink {
    pub(crate) fn new(tx: mpsc::Sender<Result<Value>>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Send one result element.
    pub async fn send<T: Serialize>(&self, item: T) -> Result<()> {
        let value = serde_json::to_value(item)?;
        self.push(Ok(value)).await
    }

    /// Send a non-fatal error element; the stream stays open.
    pub async fn send_error(&self, message: impl Into<String>) -> Result<()> {
        self.push(Err(RpcError::HandlerError {
            message: message.into(),
        }))
        .await
    }

    async fn push(&self, item: Result<Value>) -> Result<()> {
        self.cancel.check()?;
        tokio::select! {
            sent = self.tx.send(item) => sent.map_err(|_| RpcError::Cancelled),
            _ = self.cancel.cancelled() => Err(RpcError::Cancelled),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Request fragments of a streaming-request or complex call, in arrival order.
///
/// Ends when the caller closes its request side or cancels the call.
#[derive(Debug)]
pub struct RequestStream {
    rx: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
}

impl RequestStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Value>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// A stream that has already ended.
    pub(crate) fn closed(cancel: CancellationToken) -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self { rx, cancel }
    }

    /// Next fragment, `None` once the request side is closed or cancelled.
    pub async fn recv(&mut self) -> Option<Value> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            item = self.rx.recv() => item,
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Next fragment decoded as `T`.
    pub async fn recv_as<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        let value = self.recv().await?;
        Some(serde_json::from_value(value).map_err(RpcError::from))
    }
}

impl Stream for RequestStream {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}
