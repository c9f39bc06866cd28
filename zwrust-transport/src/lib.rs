//! Transport layer for the Z-Wave Serial API
//!
//! Moves raw bytes between the host and a controller. Framing lives in
//! `zwrust-core`; the [`Link`] task glues the two together and keeps the
//! transport open in the background.

pub mod error;
pub mod hid;
pub mod link;
pub mod memory;
pub mod tcp;

pub use error::{Error, Result};
pub use hid::{HidDevice, HidTransport};
pub use link::{Link, LinkConfig, LinkEvent};
pub use memory::{MemoryPeer, MemoryTransport};
pub use tcp::TcpTransport;

use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;

/// Byte transport to a controller
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the port
    async fn open(&mut self) -> Result<()>;

    /// Close the port
    async fn close(&mut self) -> Result<()>;

    /// Check if open
    fn is_open(&self) -> bool;

    /// Write raw bytes
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever bytes are available, waiting at most `timeout`
    ///
    /// Returns [`Error::ReadTimeout`] when nothing arrived. Implementations
    /// must be cancel safe: dropping the future loses no bytes.
    async fn read(&mut self, timeout: Duration) -> Result<BytesMut>;

    /// Port name for logging
    fn name(&self) -> String;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data).await
    }

    async fn read(&mut self, timeout: Duration) -> Result<BytesMut> {
        (**self).read(timeout).await
    }

    fn name(&self) -> String {
        (**self).name()
    }
}
