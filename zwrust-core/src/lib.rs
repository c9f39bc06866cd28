//! # zwrust-core
//!
//! Core protocol implementation for the Z-Wave Serial API.
//!
//! This crate provides the low-level protocol primitives:
//! - Outgoing message framing and finalization
//! - Checksum calculation
//! - Callback id allocation
//! - Incoming frame decoding
//! - Function ids and protocol constants
//! - Security command class encapsulation

pub mod callback;
pub mod checksum;
pub mod constants;
pub mod error;
pub mod frame;
pub mod function;
pub mod message;
pub mod security;

pub use callback::CallbackIds;
pub use error::{Error, Result};
pub use frame::{Frame, FrameDecoder, Incoming};
pub use function::{Function, MessageType, TransmitOptions};
pub use message::{Encapsulation, Message};
pub use security::{NonceTable, SecureFrame, SecurityKeys};

/// Serial API framing version implemented here
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default TCP port of serial-over-TCP bridges (ser2net style)
pub const DEFAULT_TCP_PORT: u16 = 4001;
