//! High-level error types

use zwrust_types::{ValueId, ValueType};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Core protocol error: {0}")]
    Core(#[from] zwrust_core::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] zwrust_transport::Error),

    #[error("Type error: {0}")]
    Types(#[from] zwrust_types::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Driver not running")]
    NotRunning,

    #[error("Driver already running")]
    AlreadyRunning,

    #[error("Node {0} not found")]
    NodeNotFound(u8),

    #[error("Value not found: {0}")]
    ValueNotFound(ValueId),

    #[error("Value is read-only: {0}")]
    ReadOnlyValue(ValueId),

    #[error("Type mismatch for {id}: expected {expected}, got {actual}")]
    TypeMismatch {
        id: ValueId,
        expected: ValueType,
        actual: ValueType,
    },

    #[error("Value out of range for {id}: {detail}")]
    OutOfRange { id: ValueId, detail: String },

    #[error("Association group {group} of node {node_id} is full")]
    GroupFull { node_id: u8, group: u8 },

    #[error("Command class 0x{0:02X} not supported")]
    UnsupportedCommandClass(u8),

    #[error("Timeout waiting for reply to {0}")]
    Timeout(String),

    #[error("Invalid response from controller: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the operation later can succeed
    ///
    /// Transport faults are retried by the link's reopen policy and timeouts
    /// by the send retry policy. Everything else is a local rejection or a
    /// malformed frame that a retry would not fix.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_recoverable(),
            Self::Timeout(_) | Self::NotRunning => true,
            _ => false,
        }
    }
}
