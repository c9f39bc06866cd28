//! Serial-over-TCP bridge transport
//!
//! Bridges such as ser2net forward the raw Serial API byte stream, so the
//! socket is used exactly like the serial line: no framing of its own.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::{error::*, Transport};

/// Largest Serial API frame plus room for a trailing ACK
const READ_CHUNK: usize = 260;

/// Socket connection to a controller behind a serial bridge
pub struct TcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    link: Option<Link>,
}

struct Link {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            link: None,
        }
    }

    /// Bound on name lookup plus connect, across all candidate addresses
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Try every address the host resolves to, first success wins
    async fn connect(&self) -> Result<Link> {
        let candidates: Vec<SocketAddr> = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", self.host, e)))?
            .collect();
        if candidates.is_empty() {
            return Err(Error::InvalidAddress(format!("{} resolves to nothing", self.host)));
        }

        let mut last_error = None;
        for peer in candidates {
            match TcpStream::connect(peer).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(Link { stream, peer });
                }
                Err(e) => {
                    debug!(%peer, "Bridge refused connection: {}", e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.map_or(Error::ConnectionClosed, Error::Io))
    }

    fn link(&mut self) -> Result<&mut Link> {
        self.link.as_mut().ok_or(Error::NotOpen)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let link = timeout(self.connect_timeout, self.connect())
            .await
            .map_err(|_| Error::OpenTimeout)??;
        info!(peer = %link.peer, "Bridge connected");
        self.link = Some(link);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut link) = self.link.take() {
            debug!(peer = %link.peer, "Closing bridge connection");
            // The peer may already be gone
            link.stream.shutdown().await.ok();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let link = self.link()?;
        trace!(data = %hex::encode(data), "tx");
        link.stream.write_all(data).await?;
        Ok(())
    }

    async fn read(&mut self, wait: Duration) -> Result<BytesMut> {
        let link = self.link()?;
        let mut chunk = BytesMut::with_capacity(READ_CHUNK);
        let n = timeout(wait, link.stream.read_buf(&mut chunk))
            .await
            .map_err(|_| Error::ReadTimeout)??;
        if n == 0 {
            info!(peer = %link.peer, "Bridge hung up");
            self.link = None;
            return Err(Error::ConnectionClosed);
        }
        trace!(data = %hex::encode(&chunk), "rx");
        Ok(chunk)
    }

    fn name(&self) -> String {
        match &self.link {
            Some(link) => format!("tcp://{}", link.peer),
            None => format!("tcp://{}:{}", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    async fn bridge() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn test_name_before_connect() {
        let transport = TcpTransport::new("zwave.local", 4001);
        assert!(!transport.is_open());
        assert_eq!(transport.name(), "tcp://zwave.local:4001");
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let mut transport =
            TcpTransport::new("invalid..address", 4001).with_connect_timeout(Duration::from_millis(100));
        assert!(transport.open().await.is_err());
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_frames_pass_through_bridge() {
        let (listener, port) = bridge().await;
        let serial_side = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 5];
            socket.read_exact(&mut request).await.unwrap();
            socket.write_all(&[0x06]).await.unwrap();
            socket.write_all(&request).await.unwrap();
            request
        });

        let mut transport = TcpTransport::new("127.0.0.1", port);
        transport.open().await.unwrap();
        assert_eq!(transport.name(), format!("tcp://127.0.0.1:{}", port));
        assert!(matches!(transport.open().await, Err(Error::AlreadyOpen)));

        let request = [0x01, 0x03, 0x00, 0x15, 0xE9];
        transport.write(&request).await.unwrap();

        let mut received = Vec::new();
        while received.len() < 6 {
            received.extend_from_slice(&transport.read(Duration::from_secs(2)).await.unwrap());
        }
        assert_eq!(serial_side.await.unwrap(), request);
        assert_eq!(received[0], 0x06);
        assert_eq!(&received[1..], &request);

        transport.close().await.unwrap();
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_hang_up_closes_link() {
        let (listener, port) = bridge().await;
        let serial_side = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut transport = TcpTransport::new("127.0.0.1", port);
        transport.open().await.unwrap();
        serial_side.await.unwrap();

        let err = transport.read(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(err.is_recoverable());
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_io_requires_open() {
        let mut transport = TcpTransport::new("127.0.0.1", 4001);
        assert!(matches!(transport.write(&[0x06]).await, Err(Error::NotOpen)));
        assert!(matches!(transport.read(Duration::from_millis(10)).await, Err(Error::NotOpen)));
    }
}
