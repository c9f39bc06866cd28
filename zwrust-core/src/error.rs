//! Error types for zwrust-core

/// Result type alias for zwrust operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core protocol errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Frame is too short to be valid
    #[error("Frame too short: expected at least {expected} bytes, got {actual} bytes")]
    FrameTooShort {
        expected: usize,
        actual: usize,
    },

    /// Checksum verification failed
    #[error("Checksum mismatch: expected 0x{expected:02X}, received 0x{received:02X}")]
    ChecksumMismatch {
        expected: u8,
        received: u8,
    },

    /// Frame does not start with SOF
    #[error("Invalid start of frame: 0x{0:02X}")]
    InvalidStart(u8),

    /// Length byte disagrees with the buffer
    #[error("Invalid frame length: header says {declared}, buffer holds {actual}")]
    InvalidLength {
        declared: usize,
        actual: usize,
    },

    /// Unknown message type byte
    #[error("Invalid message type: 0x{0:02X}")]
    InvalidMessageType(u8),

    /// Unknown function code
    #[error("Unknown function: 0x{0:02X}")]
    UnknownFunction(u8),

    /// Payload is shorter than the function requires
    #[error("Payload for {function} too short: expected at least {expected} bytes, got {actual}")]
    PayloadTooShort {
        function: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Payload would overflow the single-byte length field
    #[error("Payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge {
        size: usize,
        max: usize,
    },

    /// Message was modified after it was finalized
    #[error("Message already finalized")]
    AlreadyFinalized,

    /// Operation needs a finalized message
    #[error("Message not finalized")]
    NotFinalized,

    /// Secure frame could not be built
    #[error("Encryption failed: {0}")]
    CryptoFailed(String),

    /// Authentication tag of an incoming secure frame did not match
    #[error("Authentication failed for secure frame from node {node_id}")]
    AuthenticationFailed {
        node_id: u8,
    },

    /// No nonce is available to build or open a secure frame
    #[error("No valid nonce for node {node_id}")]
    NonceUnavailable {
        node_id: u8,
    },
}

impl Error {
    /// Check if error belongs to the crypto layer
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            Self::CryptoFailed(_)
                | Self::AuthenticationFailed { .. }
                | Self::NonceUnavailable { .. }
        )
    }

    /// Check if error is a malformed frame (dropped, never retried)
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::FrameTooShort { .. }
                | Self::ChecksumMismatch { .. }
                | Self::InvalidStart(_)
                | Self::InvalidLength { .. }
                | Self::InvalidMessageType(_)
                | Self::UnknownFunction(_)
                | Self::PayloadTooShort { .. }
        )
    }
}
