//! Transport errors

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport not open")]
    NotOpen,

    #[error("Transport already open")]
    AlreadyOpen,

    #[error("Open timeout")]
    OpenTimeout,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("Connection closed by remote")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("HID error: {0}")]
    Hid(String),

    #[error("Write too large for one feature report: {size} bytes (max: {max} bytes)")]
    ReportTooLarge { size: usize, max: usize },

    #[error("Link task has stopped")]
    LinkClosed,
}

impl Error {
    /// Whether reopening the transport may cure the error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotOpen
                | Self::OpenTimeout
                | Self::ReadTimeout
                | Self::ConnectionClosed
                | Self::Io(_)
                | Self::Hid(_)
        )
    }
}
