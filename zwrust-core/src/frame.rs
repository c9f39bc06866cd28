//! Incoming frame decoding
//!
//! The controller talks in two kinds of units: single control bytes
//! (`ACK`, `NAK`, `CAN`) and SOF-delimited data frames. [`FrameDecoder`]
//! splits a raw byte stream into these units; [`Frame::decode`] validates one
//! data frame.

use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use tracing::trace;

use crate::{
    checksum,
    constants::{ACK, CAN, NAK, SOF},
    error::{Error, Result},
    function::{Function, MessageType},
};

/// A validated data frame received from the controller
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request or response
    pub msg_type: MessageType,

    /// Raw function code (may be unknown to the driver)
    pub function: u8,

    /// Bytes between the function code and the checksum
    pub payload: Bytes,
}

impl Frame {
    /// Smallest valid frame: SOF, length, type, function, checksum
    pub const MIN_SIZE: usize = 5;

    /// Decode one complete frame (SOF through checksum)
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Buffer is shorter than [`Frame::MIN_SIZE`]
    /// - First byte is not SOF
    /// - Length byte disagrees with the buffer
    /// - Checksum verification fails
    /// - Message type byte is invalid
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::MIN_SIZE {
            return Err(Error::FrameTooShort {
                expected: Self::MIN_SIZE,
                actual: buf.len(),
            });
        }

        if buf[0] != SOF {
            return Err(Error::InvalidStart(buf[0]));
        }

        let declared = buf[1] as usize + 2;
        if declared != buf.len() {
            return Err(Error::InvalidLength {
                declared,
                actual: buf.len(),
            });
        }

        let received = buf[buf.len() - 1];
        let expected = checksum::calculate(&buf[1..buf.len() - 1]);
        if expected != received {
            return Err(Error::ChecksumMismatch { expected, received });
        }

        let msg_type = MessageType::try_from(buf[2])?;

        Ok(Self {
            msg_type,
            function: buf[3],
            payload: Bytes::copy_from_slice(&buf[4..buf.len() - 1]),
        })
    }

    /// Build a frame as the controller would send it (used by tests and loopbacks)
    pub fn encode(msg_type: MessageType, function: u8, payload: &[u8]) -> Bytes {
        let mut buf = Vec::with_capacity(payload.len() + Self::MIN_SIZE);
        buf.push(SOF);
        buf.push((payload.len() + 3) as u8);
        buf.push(msg_type as u8);
        buf.push(function);
        buf.extend_from_slice(payload);
        let checksum = checksum::calculate(&buf[1..]);
        buf.push(checksum);
        Bytes::from(buf)
    }

    /// Parsed function code
    pub fn function(&self) -> Result<Function> {
        Function::try_from(self.function)
    }

    /// Whether this is a synchronous response
    pub fn is_response(&self) -> bool {
        self.msg_type == MessageType::Response
    }

    /// Payload byte at `index`, or a protocol error naming the function
    pub fn byte(&self, index: usize) -> Result<u8> {
        self.payload
            .get(index)
            .copied()
            .ok_or_else(|| Error::PayloadTooShort {
                function: self.function().map(|f| f.name()).unwrap_or("FUNC_ID_UNKNOWN"),
                expected: index + 1,
                actual: self.payload.len(),
            })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("type", &self.msg_type)
            .field("function", &format!("0x{:02X}", self.function))
            .field("payload", &hex::encode(&self.payload))
            .finish()
    }
}

/// One unit read from the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Ack,
    Nak,
    Can,
    Frame(Frame),
}

/// Stream splitter for controller output
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the transport
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Take the next complete unit
    ///
    /// Returns `None` when more bytes are needed. A malformed data frame is
    /// consumed and reported as `Some(Err(..))` so the caller can NAK it.
    pub fn next_unit(&mut self) -> Option<Result<Incoming>> {
        loop {
            let first = *self.buf.first()?;
            match first {
                ACK => {
                    self.buf.advance(1);
                    return Some(Ok(Incoming::Ack));
                }
                NAK => {
                    self.buf.advance(1);
                    return Some(Ok(Incoming::Nak));
                }
                CAN => {
                    self.buf.advance(1);
                    return Some(Ok(Incoming::Can));
                }
                SOF => {
                    let len = *self.buf.get(1)? as usize;
                    if len < 3 {
                        self.buf.advance(2);
                        return Some(Err(Error::InvalidLength {
                            declared: len + 2,
                            actual: Frame::MIN_SIZE,
                        }));
                    }
                    let total = len + 2;
                    if self.buf.len() < total {
                        return None;
                    }
                    let raw = self.buf.split_to(total);
                    return Some(Frame::decode(&raw).map(Incoming::Frame));
                }
                other => {
                    trace!(byte = format!("0x{:02X}", other), "Discarding out-of-frame byte");
                    self.buf.advance(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frame_decode() {
        let raw = Frame::encode(MessageType::Response, 0x15, &[b'Z', 0x00, 0x01]);
        let frame = Frame::decode(&raw).unwrap();

        assert_eq!(frame.msg_type, MessageType::Response);
        assert_eq!(frame.function().unwrap(), Function::GetVersion);
        assert_eq!(frame.payload.as_ref(), &[b'Z', 0x00, 0x01]);
    }

    #[test]
    fn test_frame_checksum_mismatch() {
        let raw = Frame::encode(MessageType::Request, 0x04, &[0x00, 0x05, 0x03, 0x20, 0x03, 0xFF]);
        let mut corrupted = raw.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;

        assert!(matches!(
            Frame::decode(&corrupted),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_frame_too_short() {
        assert!(matches!(
            Frame::decode(&[0x01, 0x03]),
            Err(Error::FrameTooShort { .. })
        ));
    }

    #[test]
    fn test_frame_bad_length() {
        let mut raw = Frame::encode(MessageType::Request, 0x04, &[1, 2, 3]).to_vec();
        raw[1] += 1;
        assert!(matches!(Frame::decode(&raw), Err(Error::InvalidLength { .. })));
    }

    #[test]
    fn test_payload_byte_out_of_range() {
        let raw = Frame::encode(MessageType::Response, 0x13, &[]);
        let frame = Frame::decode(&raw).unwrap();
        assert!(matches!(frame.byte(0), Err(Error::PayloadTooShort { .. })));
    }

    #[test]
    fn test_decoder_splits_control_and_frames() {
        let mut decoder = FrameDecoder::new();
        let frame = Frame::encode(MessageType::Response, 0x13, &[0x01]);

        decoder.push(&[ACK]);
        decoder.push(&frame);
        decoder.push(&[CAN, NAK]);

        assert_eq!(decoder.next_unit().unwrap().unwrap(), Incoming::Ack);
        assert!(matches!(decoder.next_unit(), Some(Ok(Incoming::Frame(_)))));
        assert_eq!(decoder.next_unit().unwrap().unwrap(), Incoming::Can);
        assert_eq!(decoder.next_unit().unwrap().unwrap(), Incoming::Nak);
        assert!(decoder.next_unit().is_none());
    }

    #[test]
    fn test_decoder_waits_for_partial_frame() {
        let mut decoder = FrameDecoder::new();
        let frame = Frame::encode(MessageType::Request, 0x04, &[0x00, 0x05, 0x03, 0x25, 0x03, 0xFF]);

        decoder.push(&frame[..4]);
        assert!(decoder.next_unit().is_none());
        assert_eq!(decoder.buffered(), 4);

        decoder.push(&frame[4..]);
        assert!(matches!(decoder.next_unit(), Some(Ok(Incoming::Frame(_)))));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_skips_garbage() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0x99, 0x42, ACK]);

        assert_eq!(decoder.next_unit().unwrap().unwrap(), Incoming::Ack);
    }

    #[test]
    fn test_decoder_reports_corrupt_frame() {
        let mut decoder = FrameDecoder::new();
        let mut frame = Frame::encode(MessageType::Response, 0x15, &[1, 2]).to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        decoder.push(&frame);
        decoder.push(&[ACK]);

        assert!(matches!(decoder.next_unit(), Some(Err(Error::ChecksumMismatch { .. }))));
        assert_eq!(decoder.next_unit().unwrap().unwrap(), Incoming::Ack);
    }
}
