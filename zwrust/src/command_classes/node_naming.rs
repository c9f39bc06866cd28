//! Node Naming and Location (0x77)

use tracing::debug;
use zwrust_core::constants::command_class;

use super::{CcContext, CommandClassHandler, Effect, RequestFlags};
use crate::driver::queue::MsgQueue;
use crate::error::Result;
use crate::notification::Notification;

const NAME_SET: u8 = 0x01;
const NAME_GET: u8 = 0x02;
const NAME_REPORT: u8 = 0x03;
const LOCATION_SET: u8 = 0x04;
const LOCATION_GET: u8 = 0x05;
const LOCATION_REPORT: u8 = 0x06;

const CHARSET_ASCII: u8 = 0x00;
const CHARSET_UTF16: u8 = 0x02;
const CHARSET_MASK: u8 = 0x07;

/// Longest text a node stores, in bytes
const MAX_TEXT_LEN: usize = 16;

fn decode_text(charset: u8, raw: &[u8]) -> String {
    let text = if charset & CHARSET_MASK == CHARSET_UTF16 {
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(raw).into_owned()
    };
    text.trim_end_matches('\0').to_string()
}

/// Charset byte and payload for `text`, cut to what a node stores
fn encode_text(text: &str) -> (u8, Vec<u8>) {
    if text.is_ascii() {
        let bytes = text.as_bytes();
        (CHARSET_ASCII, bytes[..bytes.len().min(MAX_TEXT_LEN)].to_vec())
    } else {
        let bytes = text
            .encode_utf16()
            .take(MAX_TEXT_LEN / 2)
            .flat_map(u16::to_be_bytes)
            .collect();
        (CHARSET_UTF16, bytes)
    }
}

fn send_text(ctx: &mut CcContext<'_>, log_text: &str, command: u8, text: &str) -> Result<()> {
    let (charset, bytes) = encode_text(text);
    let mut payload = vec![command, charset];
    payload.extend_from_slice(&bytes);
    let msg = ctx.command(log_text, 1, &payload)?;
    ctx.out.send(MsgQueue::Send, msg);
    Ok(())
}

/// Store a new name on the node
pub fn set_name(ctx: &mut CcContext<'_>, name: &str) -> Result<()> {
    send_text(ctx, "NodeNamingCmd_Set", NAME_SET, name)
}

/// Store a new location on the node
pub fn set_location(ctx: &mut CcContext<'_>, location: &str) -> Result<()> {
    send_text(ctx, "NodeNamingCmd_LocationSet", LOCATION_SET, location)
}

#[derive(Debug, Default)]
pub struct NodeNaming;

impl CommandClassHandler for NodeNaming {
    fn id(&self) -> u8 {
        command_class::NODE_NAMING
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_NODE_NAMING"
    }

    fn request_state(
        &self,
        ctx: &mut CcContext<'_>,
        flags: RequestFlags,
        instance: u8,
        queue: MsgQueue,
    ) -> bool {
        if !flags.contains(RequestFlags::SESSION) {
            return false;
        }
        let name = ctx.send_request("NodeNamingCmd_Get", instance, &[NAME_GET], queue);
        let location = ctx.send_request("NodeNamingCmd_LocationGet", instance, &[LOCATION_GET], queue);
        name || location
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], _instance: u8) -> bool {
        let effect = match data {
            [NAME_REPORT, charset, raw @ ..] => Effect::Name(decode_text(*charset, raw)),
            [LOCATION_REPORT, charset, raw @ ..] => Effect::Location(decode_text(*charset, raw)),
            _ => return false,
        };
        debug!(node_id = ctx.node_id, ?effect, "Naming reported");
        ctx.effect(effect);
        ctx.notify(Notification::NodeNaming {
            home_id: ctx.home_id,
            node_id: ctx.node_id,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_classes::testing::Harness;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_reports() {
        let mut harness = Harness::new();
        let mut naming = NodeNaming;

        naming.handle_msg(&mut harness.ctx(command_class::NODE_NAMING), b"\x03\x00Porch\0\0", 1);
        naming.handle_msg(
            &mut harness.ctx(command_class::NODE_NAMING),
            &[LOCATION_REPORT, CHARSET_UTF16, 0x00, 0x4B, 0x00, 0xFC],
            1,
        );

        assert_eq!(
            harness.effects(),
            vec![Effect::Name("Porch".into()), Effect::Location("Kü".into())]
        );
        assert_eq!(harness.out.notifications.len(), 2);
    }

    #[test]
    fn test_set_name_truncates() {
        let mut harness = Harness::new();
        set_name(&mut harness.ctx(command_class::NODE_NAMING), "A very long node name").unwrap();

        let sent = harness.sent_commands();
        assert_eq!(sent[0][..3], [command_class::NODE_NAMING, NAME_SET, CHARSET_ASCII]);
        assert_eq!(sent[0].len(), 3 + MAX_TEXT_LEN);
    }

    #[test]
    fn test_set_location_utf16() {
        let (charset, bytes) = encode_text("Küche");
        assert_eq!(charset, CHARSET_UTF16);
        assert_eq!(bytes.len(), 10);
        assert_eq!(decode_text(charset, &bytes), "Küche");
    }

    #[test]
    fn test_session_requests() {
        let mut harness = Harness::new();
        let naming = NodeNaming;
        assert!(!naming.request_state(&mut harness.ctx(command_class::NODE_NAMING), RequestFlags::DYNAMIC, 1, MsgQueue::Query));
        assert!(naming.request_state(&mut harness.ctx(command_class::NODE_NAMING), RequestFlags::SESSION, 1, MsgQueue::Query));
        assert_eq!(harness.out.messages.len(), 2);
    }
}
