//! Security S0 (0x98)
//!
//! The handler only sorts security traffic. Keys and nonces are owned by
//! the driver, which resolves the [`Effect`]s raised here.

use tracing::{debug, info, warn};
use zwrust_core::constants::security::{
    MESSAGE_ENCAP, MESSAGE_ENCAP_NONCE_GET, NONCE_GET, NONCE_REPORT, SUPPORTED_GET,
    SUPPORTED_REPORT,
};
use zwrust_core::constants::{COMMAND_CLASS_MARK, command_class};

use super::{CcContext, CommandClassHandler, Effect};
use crate::driver::queue::MsgQueue;

/// Ask which classes the node only accepts encrypted
///
/// The request itself travels encrypted.
pub fn request_supported(ctx: &mut CcContext<'_>, queue: MsgQueue) -> bool {
    match ctx.request("SecurityCmd_SupportedGet", 1, &[SUPPORTED_GET]) {
        Ok(mut msg) => {
            msg.set_secure(true);
            ctx.out.send(queue, msg);
            true
        }
        Err(e) => {
            warn!(node_id = ctx.node_id, "SecurityCmd_SupportedGet not queued: {}", e);
            false
        }
    }
}

#[derive(Debug, Default)]
pub struct Security;

impl CommandClassHandler for Security {
    fn id(&self) -> u8 {
        command_class::SECURITY
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_SECURITY"
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], _instance: u8) -> bool {
        match data {
            [SUPPORTED_REPORT, _to_follow, classes @ ..] => {
                let secure: Vec<u8> = classes
                    .iter()
                    .copied()
                    .take_while(|&c| c != COMMAND_CLASS_MARK)
                    .collect();
                info!(node_id = ctx.node_id, classes = %hex::encode(&secure), "Secure classes reported");
                ctx.effect(Effect::SecureClasses(secure));
                true
            }
            [NONCE_GET, ..] => {
                debug!(node_id = ctx.node_id, "Nonce requested");
                ctx.effect(Effect::NonceRequested);
                true
            }
            [NONCE_REPORT, nonce @ ..] => match <[u8; 8]>::try_from(&nonce[..nonce.len().min(8)]) {
                Ok(nonce) => {
                    ctx.effect(Effect::NonceReceived(nonce));
                    true
                }
                Err(_) => {
                    warn!(node_id = ctx.node_id, "Short nonce report");
                    false
                }
            },
            [command @ (MESSAGE_ENCAP | MESSAGE_ENCAP_NONCE_GET), ..] => {
                let mut frame = Vec::with_capacity(data.len() + 1);
                frame.push(command_class::SECURITY);
                frame.extend_from_slice(data);
                ctx.effect(Effect::SecureMessage {
                    data: frame,
                    nonce_requested: *command == MESSAGE_ENCAP_NONCE_GET,
                });
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_classes::testing::Harness;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_supported_report_stops_at_mark() {
        let mut harness = Harness::new();
        let mut security = Security;

        security.handle_msg(
            &mut harness.ctx(command_class::SECURITY),
            &[SUPPORTED_REPORT, 0, 0x25, 0x62, COMMAND_CLASS_MARK, 0x20],
            1,
        );
        assert_eq!(harness.effects(), vec![Effect::SecureClasses(vec![0x25, 0x62])]);
    }

    #[test]
    fn test_nonce_traffic() {
        let mut harness = Harness::new();
        let mut security = Security;

        security.handle_msg(&mut harness.ctx(command_class::SECURITY), &[NONCE_GET], 1);
        security.handle_msg(&mut harness.ctx(command_class::SECURITY), &[NONCE_REPORT, 1, 2, 3, 4, 5, 6, 7, 8], 1);
        assert!(!security.handle_msg(&mut harness.ctx(command_class::SECURITY), &[NONCE_REPORT, 1, 2], 1));

        assert_eq!(
            harness.effects(),
            vec![Effect::NonceRequested, Effect::NonceReceived([1, 2, 3, 4, 5, 6, 7, 8])]
        );
    }

    #[test]
    fn test_encap_keeps_class_byte() {
        let mut harness = Harness::new();
        let mut security = Security;

        security.handle_msg(&mut harness.ctx(command_class::SECURITY), &[MESSAGE_ENCAP_NONCE_GET, 0xAA, 0xBB], 1);
        assert_eq!(
            harness.effects(),
            vec![Effect::SecureMessage {
                data: vec![command_class::SECURITY, MESSAGE_ENCAP_NONCE_GET, 0xAA, 0xBB],
                nonce_requested: true
            }]
        );
    }

    #[test]
    fn test_supported_get_is_secure() {
        let mut harness = Harness::new();
        assert!(request_supported(&mut harness.ctx(command_class::SECURITY), MsgQueue::Query));
        let (_, item) = &harness.out.messages[0];
        let crate::driver::queue::QueueItem::Send { msg, .. } = item else {
            panic!("expected a message");
        };
        assert!(msg.is_secure());
    }
}
