//! Multi Instance / Multi Channel (0x60)
//!
//! Version 1 counts instances per class. Version 2 (Multi Channel) lists
//! endpoints, each with its own class list. Both wrap commands for other
//! classes; unwrapped commands go back to the node as
//! [`Effect::Encapsulated`].

use tracing::{debug, warn};
use zwrust_core::constants::command_class;
use zwrust_core::constants::multi_instance::{MULTI_CHANNEL_ENCAP, MULTI_INSTANCE_ENCAP};

use super::{CcContext, CommandClassHandler, Effect};
use crate::driver::queue::MsgQueue;

const MULTI_INSTANCE_GET: u8 = 0x04;
const MULTI_INSTANCE_REPORT: u8 = 0x05;
const END_POINT_GET: u8 = 0x07;
const END_POINT_REPORT: u8 = 0x08;
const CAPABILITY_GET: u8 = 0x09;
const CAPABILITY_REPORT: u8 = 0x0A;

/// Queue the requests that discover instances or endpoints
///
/// `classes` are the node's supported classes; only used by version 1.
/// Returns true when anything was queued.
pub fn request_instances(ctx: &mut CcContext<'_>, classes: &[u8], queue: MsgQueue) -> bool {
    if ctx.info.version >= 2 {
        return ctx.send_request("MultiChannelCmd_EndPointGet", 1, &[END_POINT_GET], queue);
    }
    let mut queued = false;
    for &class in classes {
        if class == command_class::MULTI_INSTANCE {
            continue;
        }
        queued |= ctx.send_request("MultiInstanceCmd_Get", 1, &[MULTI_INSTANCE_GET, class], queue);
    }
    queued
}

#[derive(Debug, Default)]
pub struct MultiInstance;

impl CommandClassHandler for MultiInstance {
    fn id(&self) -> u8 {
        command_class::MULTI_INSTANCE
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_MULTI_INSTANCE/CHANNEL"
    }

    fn max_version(&self) -> u8 {
        2
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], _instance: u8) -> bool {
        match data {
            [MULTI_INSTANCE_REPORT, class, count, ..] => {
                debug!(node_id = ctx.node_id, class, count, "Instances reported");
                ctx.effect(Effect::Instances {
                    command_class_id: *class,
                    count: *count,
                });
                true
            }
            [END_POINT_REPORT, _flags, count, ..] => {
                let count = count & 0x7F;
                debug!(node_id = ctx.node_id, count, "Endpoints reported");
                for endpoint in 1..=count {
                    ctx.send_request(
                        "MultiChannelCmd_CapabilityGet",
                        1,
                        &[CAPABILITY_GET, endpoint],
                        MsgQueue::Query,
                    );
                }
                true
            }
            [CAPABILITY_REPORT, endpoint, _generic, _specific, classes @ ..] => {
                ctx.effect(Effect::Endpoint {
                    endpoint: endpoint & 0x7F,
                    classes: classes.to_vec(),
                });
                true
            }
            [MULTI_INSTANCE_ENCAP, instance, inner @ ..] if !inner.is_empty() => {
                ctx.effect(Effect::Encapsulated {
                    instance: *instance,
                    endpoint: None,
                    data: inner.to_vec(),
                });
                true
            }
            [MULTI_CHANNEL_ENCAP, source, _destination, inner @ ..] if !inner.is_empty() => {
                let endpoint = source & 0x7F;
                ctx.effect(Effect::Encapsulated {
                    instance: endpoint,
                    endpoint: Some(endpoint),
                    data: inner.to_vec(),
                });
                true
            }
            _ => {
                warn!(node_id = ctx.node_id, "Unhandled multi instance command: {}", hex::encode(data));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_classes::testing::Harness;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_v1_requests_per_class() {
        let mut harness = Harness::new();
        let classes = [command_class::SWITCH_BINARY, command_class::MULTI_INSTANCE, command_class::BASIC];

        assert!(request_instances(&mut harness.ctx(command_class::MULTI_INSTANCE), &classes, MsgQueue::Query));
        assert_eq!(
            harness.sent_commands(),
            vec![
                vec![command_class::MULTI_INSTANCE, MULTI_INSTANCE_GET, command_class::SWITCH_BINARY],
                vec![command_class::MULTI_INSTANCE, MULTI_INSTANCE_GET, command_class::BASIC],
            ]
        );
    }

    #[test]
    fn test_endpoint_report_queues_capabilities() {
        let mut harness = Harness::new();
        harness.info.version = 2;
        let mut handler = MultiInstance;

        assert!(handler.handle_msg(&mut harness.ctx(command_class::MULTI_INSTANCE), &[END_POINT_REPORT, 0x40, 0x82], 1));
        assert_eq!(harness.out.messages.len(), 2);

        handler.handle_msg(
            &mut harness.ctx(command_class::MULTI_INSTANCE),
            &[CAPABILITY_REPORT, 0x02, 0x10, 0x01, 0x25, 0x32],
            1,
        );
        assert_eq!(
            harness.effects(),
            vec![Effect::Endpoint {
                endpoint: 2,
                classes: vec![0x25, 0x32]
            }]
        );
    }

    #[test]
    fn test_unwrap_encapsulation() {
        let mut harness = Harness::new();
        let mut handler = MultiInstance;

        handler.handle_msg(&mut harness.ctx(command_class::MULTI_INSTANCE), &[MULTI_INSTANCE_ENCAP, 2, 0x25, 0x03, 0xFF], 1);
        handler.handle_msg(&mut harness.ctx(command_class::MULTI_INSTANCE), &[MULTI_CHANNEL_ENCAP, 3, 1, 0x25, 0x03, 0x00], 1);
        assert!(!handler.handle_msg(&mut harness.ctx(command_class::MULTI_INSTANCE), &[MULTI_INSTANCE_ENCAP, 2], 1));

        assert_eq!(
            harness.effects(),
            vec![
                Effect::Encapsulated {
                    instance: 2,
                    endpoint: None,
                    data: vec![0x25, 0x03, 0xFF]
                },
                Effect::Encapsulated {
                    instance: 3,
                    endpoint: Some(3),
                    data: vec![0x25, 0x03, 0x00]
                },
            ]
        );
    }
}
