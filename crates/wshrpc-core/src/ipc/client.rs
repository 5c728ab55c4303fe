//! TCP connector for the client side of a frame transport.

use super::channel::FrameChannel;
use crate::config::RouterConfig;
use crate::{Result, RpcError};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

/// Connect to a router's frame listener.
///
/// Uses `RouterConfig::CONNECT_TIMEOUT`; a refused or timed out connect is
/// reported as an IO error naming the address.
pub async fn connect_tcp(addr: SocketAddr) -> Result<FrameChannel> {
    let connected = tokio::time::timeout(RouterConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("timed out after {:?}", RouterConfig::CONNECT_TIMEOUT),
            )
        })
        .and_then(|result| result);
    let stream = connected.map_err(|e| RpcError::Io {
        message: format!("connect to {}: {}", addr, e),
        source: Some(e),
    })?;
    stream.set_nodelay(true)?;

    debug!("Connected to router at {}", addr);

    let (reader, writer) = stream.into_split();
    Ok(FrameChannel::from_stream(reader, writer, addr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_connect_to_dead_port_fails() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = connect_tcp(addr).await.unwrap_err();
        assert!(matches!(err, RpcError::Io { .. }), "got {err:?}");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("127.0.0.1:1"));
    }
}
