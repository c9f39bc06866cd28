//! Outgoing Serial API message construction and finalization

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::trace;

use crate::{
    callback::CallbackIds,
    checksum,
    constants::{command_class, multi_instance, MAX_FRAME_SIZE, MAX_MAX_TRIES, MAX_TRIES, SOF},
    error::{Error, Result},
    function::{Function, MessageType, TransmitOptions},
};

/// Multi-instance / multi-channel wrapping applied on finalize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encapsulation {
    /// Plain command
    #[default]
    None,

    /// Version 1 Multi Instance encapsulation (3 extra bytes)
    MultiInstance {
        instance: u8,
    },

    /// Version 2+ Multi Channel encapsulation (4 extra bytes)
    MultiChannel {
        endpoint: u8,
    },
}

impl Encapsulation {
    /// Number of bytes the header adds to the frame
    pub fn header_len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::MultiInstance { .. } => 3,
            Self::MultiChannel { .. } => 4,
        }
    }

    fn header(&self) -> Vec<u8> {
        match *self {
            Self::None => Vec::new(),
            Self::MultiInstance { instance } => vec![
                command_class::MULTI_INSTANCE,
                multi_instance::MULTI_INSTANCE_ENCAP,
                instance,
            ],
            Self::MultiChannel { endpoint } => vec![
                command_class::MULTI_INSTANCE,
                multi_instance::MULTI_CHANNEL_ENCAP,
                1,
                endpoint,
            ],
        }
    }
}

/// Outgoing Serial API message
///
/// # Frame Structure
///
/// ```text
/// ┌─────┬────────┬──────┬──────────┬───────────┬─────────────┬──────────┐
/// │ SOF │ Length │ Type │ Function │  Payload  │ Callback ID │ Checksum │
/// │  1  │   1    │  1   │    1     │  N bytes  │  0/1 byte   │    1     │
/// └─────┴────────┴──────┴──────────┴───────────┴─────────────┴──────────┘
/// ```
///
/// `Length` counts every byte after itself up to and including the checksum.
/// The callback id, length and checksum are written by [`Message::finalize`].
///
/// # Examples
///
/// ```
/// use zwrust_core::{CallbackIds, Function, Message, MessageType};
///
/// let ids = CallbackIds::new();
/// let mut msg = Message::new("Get Version", 0xFF, MessageType::Request, Function::GetVersion);
/// msg.finalize(&ids).unwrap();
///
/// assert_eq!(msg.as_bytes(), &[0x01, 0x03, 0x00, 0x15, 0xE9]);
/// ```
#[derive(Clone)]
pub struct Message {
    log_text: String,
    target_node_id: u8,
    msg_type: MessageType,
    function: Function,
    callback_required: bool,
    expected_reply: Option<Function>,
    expected_command_class_id: u8,
    buffer: BytesMut,
    callback_id: u8,
    finalized: bool,
    encapsulation: Encapsulation,
    send_attempts: u8,
    max_send_attempts: u8,
    secure: bool,
}

impl Message {
    /// Offset of the first payload byte
    pub const PAYLOAD_OFFSET: usize = 4;

    /// Offset of the command class id inside a SendData frame
    pub const SEND_DATA_CC_OFFSET: usize = 6;

    /// Create a message that waits for a reply with the same function id
    pub fn new(
        log_text: impl Into<String>,
        target_node_id: u8,
        msg_type: MessageType,
        function: Function,
    ) -> Self {
        let mut buffer = BytesMut::with_capacity(MAX_FRAME_SIZE);
        buffer.put_u8(SOF);
        buffer.put_u8(0); // Length, filled in during finalize
        buffer.put_u8(msg_type as u8);
        buffer.put_u8(function.into());

        Self {
            log_text: log_text.into(),
            target_node_id,
            msg_type,
            function,
            callback_required: false,
            expected_reply: Some(function),
            expected_command_class_id: 0,
            buffer,
            callback_id: 0,
            finalized: false,
            encapsulation: Encapsulation::None,
            send_attempts: 0,
            max_send_attempts: MAX_TRIES,
            secure: false,
        }
    }

    /// Create a SendData request carrying one command class command
    ///
    /// Layout: `[node, len, cc, command..., transmit options]`, callback
    /// required, completion on the SendData callback.
    pub fn send_data(
        log_text: impl Into<String>,
        target_node_id: u8,
        command_class_id: u8,
        command: &[u8],
    ) -> Self {
        let mut msg = Self::new(log_text, target_node_id, MessageType::Request, Function::SendData)
            .with_callback();

        msg.buffer.put_u8(target_node_id);
        msg.buffer.put_u8((command.len() + 1) as u8);
        msg.buffer.put_u8(command_class_id);
        msg.buffer.put_slice(command);
        msg.buffer.put_u8(TransmitOptions::default().bits());

        msg
    }

    /// Require a callback id
    pub fn with_callback(mut self) -> Self {
        self.callback_required = true;
        self
    }

    /// Complete the transaction on a different function id
    pub fn expect_reply(mut self, function: Function) -> Self {
        self.expected_reply = Some(function);
        self
    }

    /// Complete the transaction on an ApplicationCommandHandler frame for `command_class_id`
    pub fn expect_report(mut self, command_class_id: u8) -> Self {
        self.expected_reply = Some(Function::ApplicationCommandHandler);
        self.expected_command_class_id = command_class_id;
        self
    }

    /// Do not wait for any reply beyond the ACK (and callback, if any)
    pub fn without_reply(mut self) -> Self {
        self.expected_reply = None;
        self
    }

    /// Override the send attempt limit (ignored above the hard maximum)
    pub fn with_max_attempts(mut self, attempts: u8) -> Self {
        self.set_max_send_attempts(attempts);
        self
    }

    /// Append a payload byte
    pub fn append(&mut self, data: u8) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized);
        }
        self.buffer.put_u8(data);
        Ok(())
    }

    /// Append payload bytes
    pub fn extend(&mut self, data: &[u8]) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized);
        }
        self.buffer.put_slice(data);
        Ok(())
    }

    /// Select multi-instance / multi-channel wrapping
    pub fn set_encapsulation(&mut self, encapsulation: Encapsulation) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized);
        }
        self.encapsulation = encapsulation;
        Ok(())
    }

    /// Mark the message for secure transmission
    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    /// Fill in encapsulation, callback id, length and checksum
    ///
    /// Calling this on an already finalized message is a no-op.
    pub fn finalize(&mut self, ids: &CallbackIds) -> Result<()> {
        if self.finalized {
            return Ok(());
        }

        self.apply_encapsulation();

        // SOF + length + callback + checksum must fit the one-byte length field
        let tail = if self.callback_required { 2 } else { 1 };
        if self.buffer.len() + tail > MAX_FRAME_SIZE {
            return Err(Error::PayloadTooLarge {
                size: self.buffer.len() - Self::PAYLOAD_OFFSET,
                max: MAX_FRAME_SIZE - Self::PAYLOAD_OFFSET - tail,
            });
        }

        if self.callback_required {
            let id = ids.next_id();
            self.buffer.put_u8(id);
            self.callback_id = id;
        }

        // Length counts everything after itself, checksum included
        self.buffer[1] = (self.buffer.len() - 1) as u8;

        let checksum = checksum::calculate(&self.buffer[1..]);
        self.buffer.put_u8(checksum);
        self.finalized = true;

        trace!(
            node_id = self.target_node_id,
            callback_id = self.callback_id,
            frame = %hex::encode(&self.buffer),
            "Finalized {}",
            self.log_text
        );

        Ok(())
    }

    /// Draw a fresh callback id and rewrite the checksum in place
    ///
    /// Used when a finalized message is retransmitted. Messages without a
    /// callback are left untouched.
    pub fn update_callback_id(&mut self, ids: &CallbackIds) -> Result<()> {
        if !self.finalized {
            return Err(Error::NotFinalized);
        }
        if !self.callback_required {
            return Ok(());
        }

        let len = self.buffer.len();
        let id = ids.next_id();
        self.buffer[len - 2] = id;
        self.callback_id = id;
        self.buffer[len - 1] = checksum::calculate(&self.buffer[1..len - 1]);

        Ok(())
    }

    fn apply_encapsulation(&mut self) {
        if self.encapsulation == Encapsulation::None
            || self.function != Function::SendData
            || self.buffer.len() <= Self::SEND_DATA_CC_OFFSET
        {
            return;
        }

        let header = self.encapsulation.header();
        let mut buffer = BytesMut::with_capacity(MAX_FRAME_SIZE);
        buffer.put_slice(&self.buffer[..Self::SEND_DATA_CC_OFFSET]);
        buffer.put_slice(&header);
        buffer.put_slice(&self.buffer[Self::SEND_DATA_CC_OFFSET..]);

        // Inner command length grows with the header
        buffer[5] = buffer[5].wrapping_add(header.len() as u8);
        self.buffer = buffer;

        self.log_text = match self.encapsulation {
            Encapsulation::MultiInstance { instance } => {
                format!("MultiInstance Encapsulated (instance={}): {}", instance, self.log_text)
            }
            Encapsulation::MultiChannel { endpoint } => {
                format!("MultiChannel Encapsulated (endpoint={}): {}", endpoint, self.log_text)
            }
            Encapsulation::None => self.log_text.clone(),
        };
    }

    /// Raw frame bytes (complete only once finalized)
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Copy of the frame bytes
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer)
    }

    /// Total frame length in bytes
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the frame has no payload
    pub fn is_empty(&self) -> bool {
        self.buffer.len() <= Self::PAYLOAD_OFFSET
    }

    /// Payload bytes (between function id and callback/checksum)
    pub fn payload(&self) -> &[u8] {
        let end = if self.finalized {
            self.buffer.len() - if self.callback_required { 2 } else { 1 }
        } else {
            self.buffer.len()
        };
        &self.buffer[Self::PAYLOAD_OFFSET..end]
    }

    /// Command class bytes of a SendData frame (`[cc, command, params...]`)
    pub fn command_payload(&self) -> Option<&[u8]> {
        if self.function != Function::SendData || self.buffer.len() <= Self::SEND_DATA_CC_OFFSET {
            return None;
        }
        let len = self.buffer[5] as usize;
        self.buffer
            .get(Self::SEND_DATA_CC_OFFSET..Self::SEND_DATA_CC_OFFSET + len)
    }

    /// Transmit options byte of a SendData frame
    pub fn transmit_options(&self) -> Option<u8> {
        let len = self.command_payload()?.len();
        self.buffer.get(Self::SEND_DATA_CC_OFFSET + len).copied()
    }

    /// Command class targeted by a SendData frame (0 otherwise)
    pub fn sending_command_class(&self) -> u8 {
        self.command_payload()
            .and_then(|p| p.first().copied())
            .unwrap_or(0)
    }

    /// Whether this is a Wake Up "no more information" command
    pub fn is_wake_up_no_more_information(&self) -> bool {
        matches!(
            self.command_payload(),
            Some([command_class::WAKE_UP, 0x08])
        )
    }

    /// Whether this is a No Operation ping
    pub fn is_no_operation(&self) -> bool {
        matches!(self.command_payload(), Some([command_class::NO_OPERATION, ..]))
    }

    pub fn log_text(&self) -> &str {
        &self.log_text
    }

    pub fn target_node_id(&self) -> u8 {
        self.target_node_id
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn function(&self) -> Function {
        self.function
    }

    pub fn callback_required(&self) -> bool {
        self.callback_required
    }

    pub fn callback_id(&self) -> u8 {
        self.callback_id
    }

    pub fn expected_reply(&self) -> Option<Function> {
        self.expected_reply
    }

    pub fn expected_command_class_id(&self) -> u8 {
        self.expected_command_class_id
    }

    pub fn encapsulation(&self) -> Encapsulation {
        self.encapsulation
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn send_attempts(&self) -> u8 {
        self.send_attempts
    }

    pub fn set_send_attempts(&mut self, count: u8) {
        self.send_attempts = count;
    }

    pub fn max_send_attempts(&self) -> u8 {
        self.max_send_attempts
    }

    pub fn set_max_send_attempts(&mut self, count: u8) {
        if count > 0 && count < MAX_MAX_TRIES {
            self.max_send_attempts = count;
        }
    }
}

impl PartialEq for Message {
    /// Finalized messages compare equal when everything except the callback
    /// id and checksum matches. Unfinalized messages never compare equal.
    fn eq(&self, other: &Self) -> bool {
        if !(self.finalized && other.finalized) {
            return false;
        }
        let strip = |m: &Self| m.buffer.len() - if m.callback_required { 2 } else { 1 };
        self.buffer[..strip(self)] == other.buffer[..strip(other)]
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("text", &self.log_text)
            .field("node", &self.target_node_id)
            .field("function", &self.function)
            .field("callback_id", &format!("0x{:02X}", self.callback_id))
            .field("expected_reply", &self.expected_reply)
            .field("expected_cc", &format!("0x{:02X}", self.expected_command_class_id))
            .field("attempts", &self.send_attempts)
            .field("frame", &hex::encode(&self.buffer))
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.target_node_id != crate::constants::NODE_BROADCAST {
            write!(f, "{} (Node={}): ", self.log_text, self.target_node_id)?;
        } else {
            write!(f, "{}: ", self.log_text)?;
        }
        write!(f, "{}", hex::encode(&self.buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn basic_get(node: u8) -> Message {
        Message::send_data("BasicCmd_Get", node, command_class::BASIC, &[0x02])
            .expect_report(command_class::BASIC)
    }

    #[test]
    fn test_message_new() {
        let msg = Message::new("Get Version", 0xFF, MessageType::Request, Function::GetVersion);
        assert_eq!(msg.function(), Function::GetVersion);
        assert_eq!(msg.expected_reply(), Some(Function::GetVersion));
        assert!(!msg.is_finalized());
        assert!(msg.is_empty());
    }

    #[test]
    fn test_send_data_layout() {
        let ids = CallbackIds::new();
        let mut msg = basic_get(5);
        msg.finalize(&ids).unwrap();

        // SOF len type func node len cc cmd txopt cb checksum
        assert_eq!(msg.len(), 11);
        assert_eq!(msg.as_bytes()[1], 9);
        assert_eq!(&msg.as_bytes()[2..9], &[0x00, 0x13, 5, 2, 0x20, 0x02, 0x25]);
        assert_eq!(msg.callback_id(), 1);
        assert_eq!(msg.as_bytes()[9], 1);
        assert!(checksum::verify_frame(msg.as_bytes()));
        assert_eq!(msg.command_payload(), Some(&[0x20, 0x02][..]));
        assert_eq!(msg.transmit_options(), Some(0x25));
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let ids = CallbackIds::new();
        let mut msg = basic_get(5);
        msg.finalize(&ids).unwrap();
        let first = msg.to_bytes();

        msg.finalize(&ids).unwrap();

        assert_eq!(msg.to_bytes(), first);
        assert_eq!(ids.peek(), 2);
    }

    #[test]
    fn test_append_after_finalize_fails() {
        let ids = CallbackIds::new();
        let mut msg = basic_get(5);
        msg.finalize(&ids).unwrap();

        assert!(matches!(msg.append(0x00), Err(Error::AlreadyFinalized)));
    }

    #[test]
    fn test_update_callback_id() {
        let ids = CallbackIds::new();
        let mut msg = basic_get(5);
        msg.finalize(&ids).unwrap();
        let len = msg.len();

        msg.update_callback_id(&ids).unwrap();

        assert_eq!(msg.callback_id(), 2);
        assert_eq!(msg.len(), len);
        assert_eq!(msg.as_bytes()[len - 2], 2);
        assert!(checksum::verify_frame(msg.as_bytes()));
    }

    #[test]
    fn test_update_callback_requires_finalize() {
        let ids = CallbackIds::new();
        let mut msg = basic_get(5);
        assert!(matches!(msg.update_callback_id(&ids), Err(Error::NotFinalized)));
    }

    #[test]
    fn test_multi_instance_encapsulation() {
        let ids = CallbackIds::new();
        let mut plain = basic_get(5);
        plain.finalize(&ids).unwrap();

        let mut wrapped = basic_get(5);
        wrapped
            .set_encapsulation(Encapsulation::MultiInstance { instance: 2 })
            .unwrap();
        wrapped.finalize(&ids).unwrap();

        assert_eq!(wrapped.len(), plain.len() + 3);
        assert_eq!(&wrapped.as_bytes()[5..12], &[5, 0x60, 0x06, 2, 0x20, 0x02, 0x25]);
        assert!(checksum::verify_frame(wrapped.as_bytes()));
    }

    #[test]
    fn test_multi_channel_encapsulation() {
        let ids = CallbackIds::new();
        let mut plain = basic_get(5);
        plain.finalize(&ids).unwrap();

        let mut wrapped = basic_get(5);
        wrapped
            .set_encapsulation(Encapsulation::MultiChannel { endpoint: 3 })
            .unwrap();
        wrapped.finalize(&ids).unwrap();

        assert_eq!(wrapped.len(), plain.len() + 4);
        assert_eq!(wrapped.as_bytes()[5], 6);
        assert_eq!(&wrapped.as_bytes()[6..10], &[0x60, 0x0D, 0x01, 3]);
        assert_eq!(wrapped.command_payload(), Some(&[0x60, 0x0D, 0x01, 3, 0x20, 0x02][..]));
    }

    #[test]
    fn test_encapsulation_ignored_for_controller_functions() {
        let ids = CallbackIds::new();
        let mut msg = Message::new("Get Version", 0xFF, MessageType::Request, Function::GetVersion);
        msg.set_encapsulation(Encapsulation::MultiChannel { endpoint: 1 })
            .unwrap();
        msg.finalize(&ids).unwrap();

        assert_eq!(msg.len(), 5);
    }

    #[test]
    fn test_equality_ignores_callback() {
        let ids = CallbackIds::new();
        let mut a = basic_get(5);
        let mut b = basic_get(5);
        a.finalize(&ids).unwrap();
        b.finalize(&ids).unwrap();

        assert_ne!(a.callback_id(), b.callback_id());
        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_requires_finalize() {
        let a = basic_get(5);
        let b = basic_get(5);
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_targets_not_equal() {
        let ids = CallbackIds::new();
        let mut a = basic_get(5);
        let mut b = basic_get(6);
        a.finalize(&ids).unwrap();
        b.finalize(&ids).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_payload_too_large() {
        let ids = CallbackIds::new();
        let mut msg = Message::send_data("Big", 5, 0x70, &[0u8; 250]);
        assert!(matches!(msg.finalize(&ids), Err(Error::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_wake_up_no_more_information() {
        let msg = Message::send_data("WakeUpCmd_NoMoreInformation", 7, 0x84, &[0x08]);
        assert!(msg.is_wake_up_no_more_information());
        assert!(!msg.is_no_operation());
    }

    #[test]
    fn test_max_attempts_clamped() {
        let msg = basic_get(1).with_max_attempts(50);
        assert_eq!(msg.max_send_attempts(), MAX_TRIES);

        let msg = basic_get(1).with_max_attempts(5);
        assert_eq!(msg.max_send_attempts(), 5);
    }

    proptest! {
        #[test]
        fn prop_finalized_frames_verify(
            node in 1u8..=232,
            cc in any::<u8>(),
            command in proptest::collection::vec(any::<u8>(), 1..40),
            start in any::<u8>(),
        ) {
            let ids = CallbackIds::with_start(start);
            let mut msg = Message::send_data("prop", node, cc, &command);
            msg.finalize(&ids).unwrap();

            let xor = msg.as_bytes()[1..]
                .iter()
                .fold(checksum::CHECKSUM_SEED, |acc, b| acc ^ b);
            prop_assert_eq!(xor, 0);
            prop_assert!(checksum::verify_frame(msg.as_bytes()));
            prop_assert_eq!(msg.as_bytes()[1] as usize, msg.len() - 2);
        }
    }
}
