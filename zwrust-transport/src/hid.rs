//! HID transport
//!
//! Some USB sticks expose the Serial API through HID feature reports
//! instead of a CDC serial port:
//!
//! | Report | Direction | Purpose                                  |
//! |--------|-----------|------------------------------------------|
//! | `0x02` | get       | capability                               |
//! | `0x03` | send      | enable Z-Wave packet reports             |
//! | `0x04` | send      | tx: `[0x04, len, data...]`               |
//! | `0x05` | get       | rx: `[0x05, len, data...]`               |
//!
//! Input reports announce pending rx data: byte 2 is `0x01` when idle and
//! `0x02` when report `0x05` is waiting.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::{error::*, Transport};

/// Capability report id
pub const REPORT_CAPABILITY: u8 = 0x02;
/// Enable report id
pub const REPORT_ENABLE: u8 = 0x03;
/// Transmit report id
pub const REPORT_TX: u8 = 0x04;
/// Receive report id
pub const REPORT_RX: u8 = 0x05;

/// Size of one feature report
pub const FEATURE_REPORT_LENGTH: usize = 0x40;
/// Size of one input report
pub const INPUT_REPORT_LENGTH: usize = 5;
/// Packet buffer holding one rx report
pub const PACKET_BUFFER_LENGTH: usize = 256;

const ENABLE_ZWAVE: [u8; 3] = [REPORT_CAPABILITY, 0x01, 0x04];
const INPUT_IDLE: u8 = 0x01;
const INPUT_RX_WAITING: u8 = 0x02;

/// Raw HID device primitives (hidapi style)
///
/// Calls must not block: `read_input_report` returns `Ok(0)` when no input
/// report is pending.
pub trait HidDevice: Send + Sync {
    /// Open the device
    fn open(&mut self) -> io::Result<()>;

    /// Close the device
    fn close(&mut self);

    /// Read feature report `report_id` into `buf` (byte 0 is the report id)
    fn get_feature_report(&mut self, report_id: u8, buf: &mut [u8]) -> io::Result<usize>;

    /// Send a feature report (byte 0 is the report id)
    fn send_feature_report(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Poll for an input report
    fn read_input_report(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Device description for logging
    fn description(&self) -> String;
}

/// Transport over an HID feature-report device
pub struct HidTransport<D: HidDevice> {
    device: D,
    open: bool,
    poll_interval: Duration,
}

impl<D: HidDevice> HidTransport<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            open: false,
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Set the input report polling interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn hid_error(context: &str, err: io::Error) -> Error {
        Error::Hid(format!("{}: {}", context, err))
    }

    fn enable(&mut self) -> Result<()> {
        let mut buf = [0u8; FEATURE_REPORT_LENGTH];

        self.device
            .get_feature_report(REPORT_CAPABILITY, &mut buf)
            .map_err(|e| Self::hid_error("capability report", e))?;
        self.device
            .send_feature_report(&ENABLE_ZWAVE)
            .map_err(|e| Self::hid_error("enable report", e))?;
        self.device
            .get_feature_report(REPORT_CAPABILITY, &mut buf)
            .map_err(|e| Self::hid_error("capability report", e))?;

        Ok(())
    }

    /// Fetch pending rx data, if any
    fn poll_rx(&mut self) -> Result<Option<BytesMut>> {
        let mut input = [0u8; INPUT_REPORT_LENGTH];
        let n = self
            .device
            .read_input_report(&mut input)
            .map_err(|e| Self::hid_error("input report", e))?;

        if n == 0 {
            return Ok(None);
        }

        match input[2] {
            INPUT_IDLE => Ok(None),
            INPUT_RX_WAITING => {
                let mut packet = [0u8; PACKET_BUFFER_LENGTH];
                let read = self
                    .device
                    .get_feature_report(REPORT_RX, &mut packet[..FEATURE_REPORT_LENGTH])
                    .map_err(|e| Self::hid_error("rx report", e))?;

                if read <= 2 {
                    return Ok(None);
                }

                let len = (packet[1] as usize).min(read - 2);
                trace!(len, data = %hex::encode(&packet[2..2 + len]), "HID read");
                Ok(Some(BytesMut::from(&packet[2..2 + len])))
            }
            other => Err(Error::Hid(format!(
                "unexpected input report state 0x{:02X}",
                other
            ))),
        }
    }
}

#[async_trait]
impl<D: HidDevice> Transport for HidTransport<D> {
    async fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(Error::AlreadyOpen);
        }

        info!("Opening HID port {}", self.device.description());
        self.device
            .open()
            .map_err(|e| Self::hid_error("open", e))?;

        if let Err(e) = self.enable() {
            warn!("Failed to enable HID port {}: {}", self.device.description(), e);
            self.device.close();
            return Err(e);
        }

        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            debug!("Closing HID port {}", self.device.description());
            self.device.close();
            self.open = false;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }

        let max = FEATURE_REPORT_LENGTH - 2;
        if data.len() > max {
            return Err(Error::ReportTooLarge {
                size: data.len(),
                max,
            });
        }

        let mut report = [0u8; FEATURE_REPORT_LENGTH];
        report[0] = REPORT_TX;
        report[1] = data.len() as u8;
        report[2..2 + data.len()].copy_from_slice(data);

        trace!(len = data.len(), data = %hex::encode(data), "HID write");

        let sent = self
            .device
            .send_feature_report(&report)
            .map_err(|e| Self::hid_error("tx report", e))?;
        if sent < 2 {
            return Err(Error::Hid(format!("tx report accepted only {} bytes", sent)));
        }

        Ok(())
    }

    async fn read(&mut self, wait: Duration) -> Result<BytesMut> {
        if !self.open {
            return Err(Error::NotOpen);
        }

        let deadline = Instant::now() + wait;
        loop {
            if let Some(data) = self.poll_rx()? {
                return Ok(data);
            }
            if Instant::now() >= deadline {
                return Err(Error::ReadTimeout);
            }
            sleep(self.poll_interval).await;
        }
    }

    fn name(&self) -> String {
        self.device.description()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeHid {
        opened: bool,
        fail_open: bool,
        sent: Vec<Vec<u8>>,
        rx: VecDeque<Vec<u8>>,
    }

    impl HidDevice for FakeHid {
        fn open(&mut self) -> io::Result<()> {
            if self.fail_open {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no device"));
            }
            self.opened = true;
            Ok(())
        }

        fn close(&mut self) {
            self.opened = false;
        }

        fn get_feature_report(&mut self, report_id: u8, buf: &mut [u8]) -> io::Result<usize> {
            buf[0] = report_id;
            if report_id == REPORT_RX {
                if let Some(data) = self.rx.pop_front() {
                    buf[1] = data.len() as u8;
                    buf[2..2 + data.len()].copy_from_slice(&data);
                    return Ok(2 + data.len());
                }
                buf[1] = 0;
                return Ok(2);
            }
            Ok(2)
        }

        fn send_feature_report(&mut self, data: &[u8]) -> io::Result<usize> {
            self.sent.push(data.to_vec());
            Ok(data.len())
        }

        fn read_input_report(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            buf[0] = 0x03;
            buf[1] = 0x01;
            buf[2] = if self.rx.is_empty() { INPUT_IDLE } else { INPUT_RX_WAITING };
            Ok(INPUT_REPORT_LENGTH)
        }

        fn description(&self) -> String {
            "fake-hid".to_string()
        }
    }

    #[tokio::test]
    async fn test_hid_open_enables_zwave() {
        let mut transport = HidTransport::new(FakeHid::default());
        transport.open().await.unwrap();

        assert!(transport.is_open());
        assert_eq!(transport.device().sent, vec![ENABLE_ZWAVE.to_vec()]);
    }

    #[tokio::test]
    async fn test_hid_open_failure() {
        let device = FakeHid {
            fail_open: true,
            ..Default::default()
        };
        let mut transport = HidTransport::new(device);

        assert!(matches!(transport.open().await, Err(Error::Hid(_))));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_hid_write_wraps_tx_report() {
        let mut transport = HidTransport::new(FakeHid::default());
        transport.open().await.unwrap();
        transport.write(&[0x01, 0x03, 0x00, 0x15, 0xE9]).await.unwrap();

        let report = &transport.device().sent[1];
        assert_eq!(report.len(), FEATURE_REPORT_LENGTH);
        assert_eq!(&report[..7], &[REPORT_TX, 5, 0x01, 0x03, 0x00, 0x15, 0xE9]);
    }

    #[tokio::test]
    async fn test_hid_write_too_large() {
        let mut transport = HidTransport::new(FakeHid::default());
        transport.open().await.unwrap();

        assert!(matches!(
            transport.write(&[0u8; FEATURE_REPORT_LENGTH]).await,
            Err(Error::ReportTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_hid_read_rx_report() {
        let mut device = FakeHid::default();
        device.rx.push_back(vec![0x06]);
        let mut transport = HidTransport::new(device);
        transport.open().await.unwrap();

        let data = transport.read(Duration::from_millis(50)).await.unwrap();
        assert_eq!(data.as_ref(), &[0x06]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hid_read_timeout() {
        let mut transport = HidTransport::new(FakeHid::default());
        transport.open().await.unwrap();

        assert!(matches!(
            transport.read(Duration::from_millis(50)).await,
            Err(Error::ReadTimeout)
        ));
    }
}
