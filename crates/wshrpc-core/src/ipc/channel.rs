//! In-process frame channels.

use crate::config::RouterConfig;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::protocol::{read_frame, write_frame};

/// One end of a duplex frame transport.
#[derive(Debug)]
pub struct FrameChannel {
    /// Frames towards the peer.
    pub tx: mpsc::Sender<Bytes>,
    /// Frames from the peer.
    pub rx: mpsc::Receiver<Bytes>,
}

/// Create two connected frame channel ends.
pub fn frame_pair(capacity: usize) -> (FrameChannel, FrameChannel) {
    let capacity = capacity.max(1);
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        FrameChannel { tx: a_tx, rx: a_rx },
        FrameChannel { tx: b_tx, rx: b_rx },
    )
}

impl FrameChannel {
    /// Bridge a byte stream into a frame channel.
    ///
    /// Spawns one task that reads length-prefixed frames from the stream and
    /// one that writes frames to it. Both stop when either side closes.
    pub fn from_stream<R, W>(reader: R, writer: W, label: String) -> FrameChannel
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        bridge(reader, writer, label, None, ())
    }
}

/// Bridge a byte stream, optionally stopping on a shutdown signal. `guard` is
/// held by the reader task and dropped when the transport closes.
pub(crate) fn bridge<R, W, G>(
    mut reader: R,
    mut writer: W,
    label: String,
    shutdown: Option<watch::Receiver<bool>>,
    guard: G,
) -> FrameChannel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    G: Send + 'static,
{
    let (local, remote) = frame_pair(RouterConfig::FRAME_QUEUE_SIZE);
    let FrameChannel {
        tx: inbound_tx,
        rx: mut outbound_rx,
    } = remote;

    let read_label = label.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let mut shutdown = shutdown;
        loop {
            let result = match shutdown.as_mut() {
                Some(rx) => tokio::select! {
                    result = read_frame(&mut reader) => result,
                    _ = rx.changed() => {
                        debug!("Transport {} closing for shutdown", read_label);
                        break;
                    }
                },
                None => read_frame(&mut reader).await,
            };
            match result {
                Ok(Some(frame)) => {
                    if inbound_tx.send(Bytes::from(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Transport {} closed by peer", read_label);
                    break;
                }
                Err(e) => {
                    debug!("Transport {} read failed: {}", read_label, e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("Transport {} write failed: {}", label, e);
                break;
            }
        }
    });

    local
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_pair_is_crossed() {
        let (mut a, mut b) = frame_pair(4);
        a.tx.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b.rx.recv().await.unwrap(), Bytes::from_static(b"ping"));

        b.tx.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(a.rx.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_from_stream_over_duplex() {
        let (left, right) = tokio::io::duplex(1024);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);

        let left_chan = FrameChannel::from_stream(lr, lw, "left".into());
        let mut right_chan = FrameChannel::from_stream(rr, rw, "right".into());

        left_chan.tx.send(Bytes::from_static(b"hello")).await.unwrap();
        let got = right_chan.rx.recv().await.unwrap();
        assert_eq!(&got[..], b"hello");
    }
}
