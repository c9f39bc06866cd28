//! Background link task
//!
//! A [`Link`] owns a [`Transport`] on its own task. It opens the port
//! (retrying on a backoff schedule), splits incoming bytes into frames and
//! control bytes, forwards them as [`LinkEvent`]s, and serialises writes
//! queued by the driver.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use zwrust_core::{FrameDecoder, Incoming};

use crate::{error::*, Transport};

/// Reopen schedule and polling for a [`Link`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Delay between reopen attempts during the initial window
    pub short_backoff: Duration,
    /// Number of attempts that use the short delay
    pub short_attempts: u32,
    /// Delay once the initial window is exhausted
    pub long_backoff: Duration,
    /// How long a single read waits before checking for writes and shutdown
    pub read_timeout: Duration,
    /// Capacity of the event and write channels
    pub channel_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            short_backoff: Duration::from_secs(5),
            short_attempts: 25,
            long_backoff: Duration::from_secs(30),
            read_timeout: Duration::from_millis(100),
            channel_capacity: 64,
        }
    }
}

impl LinkConfig {
    /// Set the reopen schedule
    pub fn with_backoff(mut self, short: Duration, short_attempts: u32, long: Duration) -> Self {
        self.short_backoff = short;
        self.short_attempts = short_attempts;
        self.long_backoff = long;
        self
    }

    /// Delay before reopen attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= self.short_attempts {
            self.short_backoff
        } else {
            self.long_backoff
        }
    }
}

/// What the link reports to the driver
#[derive(Debug)]
pub enum LinkEvent {
    /// Port opened (initially or after a reopen)
    Opened,
    /// Port lost; the link is reopening it
    Closed,
    /// Control byte or valid data frame
    Received(Incoming),
    /// Data frame that failed validation; the peer expects a NAK
    Malformed(zwrust_core::Error),
}

/// Handle to the background link task
pub struct Link {
    writes: mpsc::Sender<Bytes>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    name: String,
}

impl Link {
    /// Start the link task
    ///
    /// Returns the handle and the receiver of link events.
    pub fn spawn<T>(transport: T, config: LinkConfig) -> (Self, mpsc::Receiver<LinkEvent>)
    where
        T: Transport + 'static,
    {
        let (writes_tx, writes_rx) = mpsc::channel(config.channel_capacity);
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = transport.name();

        let task = tokio::spawn(run(transport, config, writes_rx, events_tx, shutdown_rx));

        (
            Self {
                writes: writes_tx,
                shutdown: shutdown_tx,
                task: Some(task),
                name,
            },
            events_rx,
        )
    }

    /// Queue bytes for the transport
    pub async fn write(&self, data: Bytes) -> Result<()> {
        self.writes.send(data).await.map_err(|_| Error::LinkClosed)
    }

    /// Cloneable writer for other tasks
    pub fn writer(&self) -> mpsc::Sender<Bytes> {
        self.writes.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the task to stop, close the port and wait for it
    pub async fn close(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        }
        info!("Link {} closed", self.name);
        Ok(())
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.shutdown.send(true);
        }
    }
}

enum Session {
    /// Port failed; reopen
    Lost,
    /// Shutdown requested or driver gone
    Stop,
}

async fn run<T: Transport>(
    mut transport: T,
    config: LinkConfig,
    mut writes: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempts: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = transport.open().await {
            attempts = attempts.saturating_add(1);
            let delay = config.backoff(attempts);
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Failed to open {}: {}",
                transport.name(),
                e
            );

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(delay) => continue,
            }
        }

        attempts = 0;
        info!("Opened {}", transport.name());
        if events.send(LinkEvent::Opened).await.is_err() {
            break;
        }

        match session(&mut transport, &config, &mut writes, &events, &mut shutdown).await {
            Session::Stop => break,
            Session::Lost => {
                let _ = transport.close().await;
                if events.send(LinkEvent::Closed).await.is_err() {
                    break;
                }
                // Give the port a moment before the first reopen
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(config.backoff(1)) => {}
                }
            }
        }
    }

    let _ = transport.close().await;
    debug!("Link task for {} stopped", transport.name());
}

async fn session<T: Transport>(
    transport: &mut T,
    config: &LinkConfig,
    writes: &mut mpsc::Receiver<Bytes>,
    events: &mpsc::Sender<LinkEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Session {
    let mut decoder = FrameDecoder::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => return Session::Stop,

            data = writes.recv() => {
                let Some(data) = data else {
                    return Session::Stop;
                };
                if let Err(e) = transport.write(&data).await {
                    warn!("Write to {} failed: {}", transport.name(), e);
                    return Session::Lost;
                }
            }

            read = transport.read(config.read_timeout) => match read {
                Ok(bytes) => {
                    decoder.push(&bytes);
                    while let Some(unit) = decoder.next_unit() {
                        let event = match unit {
                            Ok(incoming) => LinkEvent::Received(incoming),
                            Err(e) => {
                                warn!("Malformed frame from {}: {}", transport.name(), e);
                                LinkEvent::Malformed(e)
                            }
                        };
                        if events.send(event).await.is_err() {
                            return Session::Stop;
                        }
                    }
                }
                Err(Error::ReadTimeout) => {}
                Err(e) => {
                    warn!("Read from {} failed: {}", transport.name(), e);
                    return Session::Lost;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTransport;
    use pretty_assertions::assert_eq;
    use zwrust_core::{constants::ACK, Frame, MessageType};

    fn fast_config() -> LinkConfig {
        LinkConfig::default()
            .with_backoff(Duration::from_millis(50), 2, Duration::from_millis(500))
    }

    #[test]
    fn test_backoff_schedule() {
        let config = LinkConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(5));
        assert_eq!(config.backoff(25), Duration::from_secs(5));
        assert_eq!(config.backoff(26), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_link_forwards_frames_and_writes() {
        let (transport, mut peer) = MemoryTransport::pair("mem0");
        let (link, mut events) = Link::spawn(transport, fast_config());

        assert!(matches!(events.recv().await, Some(LinkEvent::Opened)));

        link.write(Bytes::from_static(&[0x01, 0x03, 0x00, 0x15, 0xE9]))
            .await
            .unwrap();
        assert_eq!(
            peer.recv().await.unwrap().as_ref(),
            &[0x01, 0x03, 0x00, 0x15, 0xE9]
        );

        let frame = Frame::encode(MessageType::Response, 0x15, &[b'Z', 0x00]);
        let mut bytes = vec![ACK];
        bytes.extend_from_slice(&frame);
        peer.send(&bytes).unwrap();

        assert!(matches!(
            events.recv().await,
            Some(LinkEvent::Received(Incoming::Ack))
        ));
        match events.recv().await {
            Some(LinkEvent::Received(Incoming::Frame(f))) => assert_eq!(f.function, 0x15),
            other => panic!("unexpected event {:?}", other),
        }

        link.close().await.unwrap();
        assert!(!peer.is_host_open());
    }

    #[tokio::test]
    async fn test_link_reports_malformed() {
        let (transport, peer) = MemoryTransport::pair("mem0");
        let (link, mut events) = Link::spawn(transport, fast_config());
        assert!(matches!(events.recv().await, Some(LinkEvent::Opened)));

        let mut frame = Frame::encode(MessageType::Request, 0x04, &[0, 5, 2, 0x20, 0x03]).to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0x5A;
        peer.send(&frame).unwrap();

        assert!(matches!(events.recv().await, Some(LinkEvent::Malformed(_))));
        link.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_retries_open() {
        let (transport, peer) = MemoryTransport::pair("mem0");
        peer.fail_next_opens(3);

        let (link, mut events) = Link::spawn(transport, fast_config());

        assert!(matches!(events.recv().await, Some(LinkEvent::Opened)));
        assert_eq!(peer.open_attempts(), 4);

        link.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_reopens_after_loss() {
        let (transport, peer) = MemoryTransport::pair("mem0");
        let (link, mut events) = Link::spawn(transport, fast_config());
        assert!(matches!(events.recv().await, Some(LinkEvent::Opened)));

        peer.disconnect();

        assert!(matches!(events.recv().await, Some(LinkEvent::Closed)));
        assert!(matches!(events.recv().await, Some(LinkEvent::Opened)));
        assert_eq!(peer.open_attempts(), 2);

        link.close().await.unwrap();
    }
}
