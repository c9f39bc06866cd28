//! In-memory loopback transport
//!
//! [`MemoryTransport::pair`] returns the host side and a [`MemoryPeer`]
//! that plays the controller. Useful for driving the protocol stack in tests
//! without hardware.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::trace;

use crate::{error::*, Transport};

#[derive(Debug, Default)]
struct Shared {
    open: AtomicBool,
    failing_opens: AtomicUsize,
    open_attempts: AtomicUsize,
}

/// Host side of an in-memory link
pub struct MemoryTransport {
    name: String,
    to_peer: mpsc::UnboundedSender<Bytes>,
    from_peer: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
}

/// Controller side of an in-memory link
pub struct MemoryPeer {
    to_host: mpsc::UnboundedSender<Bytes>,
    from_host: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// Create a connected host / peer pair
    pub fn pair(name: impl Into<String>) -> (Self, MemoryPeer) {
        let (to_peer, from_host) = mpsc::unbounded_channel();
        let (to_host, from_peer) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        (
            Self {
                name: name.into(),
                to_peer,
                from_peer,
                shared: Arc::clone(&shared),
            },
            MemoryPeer {
                to_host,
                from_host,
                shared,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self) -> Result<()> {
        self.shared.open_attempts.fetch_add(1, Ordering::AcqRel);

        let failing = self
            .shared
            .failing_opens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} unavailable", self.name),
            )));
        }

        if self.shared.open.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyOpen);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        trace!(len = data.len(), data = %hex::encode(data), "Memory write");
        self.to_peer
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn read(&mut self, wait: Duration) -> Result<BytesMut> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }

        match timeout(wait, self.from_peer.recv()).await {
            Err(_) => Err(Error::ReadTimeout),
            Ok(None) => {
                self.shared.open.store(false, Ordering::Release);
                Err(Error::ConnectionClosed)
            }
            Ok(Some(data)) => Ok(BytesMut::from(&data[..])),
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl MemoryPeer {
    /// Send bytes to the host
    pub fn send(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.to_host
            .send(Bytes::copy_from_slice(data.as_ref()))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Next chunk the host wrote
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.from_host.recv().await
    }

    /// Next chunk the host wrote, or `None` after `wait`
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Bytes> {
        timeout(wait, self.from_host.recv()).await.ok().flatten()
    }

    /// Make the next `count` open attempts fail
    pub fn fail_next_opens(&self, count: usize) {
        self.shared.failing_opens.store(count, Ordering::Release);
    }

    /// Number of times the host tried to open
    pub fn open_attempts(&self) -> usize {
        self.shared.open_attempts.load(Ordering::Acquire)
    }

    /// Whether the host side is currently open
    pub fn is_host_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Simulate the port vanishing: the host's next read fails
    pub fn disconnect(&self) {
        self.shared.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let (mut host, mut peer) = MemoryTransport::pair("mem0");
        host.open().await.unwrap();

        host.write(&[0x01, 0x03, 0x00, 0x15, 0xE9]).await.unwrap();
        assert_eq!(peer.recv().await.unwrap().as_ref(), &[0x01, 0x03, 0x00, 0x15, 0xE9]);

        peer.send([0x06]).unwrap();
        let data = host.read(Duration::from_millis(100)).await.unwrap();
        assert_eq!(data.as_ref(), &[0x06]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_read_timeout() {
        let (mut host, _peer) = MemoryTransport::pair("mem0");
        host.open().await.unwrap();

        assert!(matches!(
            host.read(Duration::from_millis(10)).await,
            Err(Error::ReadTimeout)
        ));
    }

    #[tokio::test]
    async fn test_memory_failing_opens() {
        let (mut host, peer) = MemoryTransport::pair("mem0");
        peer.fail_next_opens(2);

        assert!(host.open().await.is_err());
        assert!(host.open().await.is_err());
        host.open().await.unwrap();
        assert_eq!(peer.open_attempts(), 3);
        assert!(peer.is_host_open());
    }

    #[tokio::test]
    async fn test_memory_write_requires_open() {
        let (mut host, _peer) = MemoryTransport::pair("mem0");
        assert!(matches!(host.write(&[0x06]).await, Err(Error::NotOpen)));
    }
}
