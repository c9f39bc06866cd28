//! Basic (0x20)

use tracing::debug;
use zwrust_core::constants::command_class;
use zwrust_types::{ValueGenre, ValueType};

use super::{CcContext, CommandClassHandler, RequestFlags};
use crate::driver::queue::MsgQueue;
use crate::error::Result;
use crate::notification::Notification;
use crate::value::{Value, ValueData};

const SET: u8 = 0x01;
const GET: u8 = 0x02;
const REPORT: u8 = 0x03;

#[derive(Debug, Default)]
pub struct Basic;

impl CommandClassHandler for Basic {
    fn id(&self) -> u8 {
        command_class::BASIC
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_BASIC"
    }

    fn create_vars(&self, ctx: &mut CcContext<'_>, instance: u8) {
        if let Ok(id) = ctx.value_id(ValueGenre::Basic, instance, 0, ValueType::Byte) {
            let label = ctx.label("basic.basic", "Basic");
            ctx.add_value(Value::new(id, label));
        }
    }

    fn request_state(
        &self,
        ctx: &mut CcContext<'_>,
        flags: RequestFlags,
        instance: u8,
        queue: MsgQueue,
    ) -> bool {
        flags.contains(RequestFlags::DYNAMIC) && self.request_value(ctx, 0, instance, queue)
    }

    fn request_value(&self, ctx: &mut CcContext<'_>, _index: u8, instance: u8, queue: MsgQueue) -> bool {
        ctx.send_request("BasicCmd_Get", instance, &[GET], queue)
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], instance: u8) -> bool {
        match data {
            [REPORT, level, ..] => {
                debug!(node_id = ctx.node_id, level, "Received Basic report");
                self.update_value(ctx, instance, 0, ValueData::Byte(*level));
                true
            }
            [SET, event, ..] => {
                // Nodes send Basic Set to report local events
                debug!(node_id = ctx.node_id, event, "Received Basic set");
                let notification = Notification::NodeEvent {
                    home_id: ctx.home_id,
                    node_id: ctx.node_id,
                    event: *event,
                };
                ctx.notify(notification);
                true
            }
            _ => false,
        }
    }

    fn set_value(&self, ctx: &mut CcContext<'_>, value: &Value, data: &ValueData) -> Result<bool> {
        let ValueData::Byte(level) = data else {
            return Ok(false);
        };
        let msg = ctx.command("BasicCmd_Set", value.id().instance, &[SET, *level])?;
        ctx.send_set(msg, value.id());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_classes::testing::Harness;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_report_needs_confirmation() {
        let mut harness = Harness::new();
        let mut basic = Basic;
        basic.create_vars(&mut harness.ctx(command_class::BASIC), 1);

        assert!(basic.handle_msg(&mut harness.ctx(command_class::BASIC), &[REPORT, 0x00], 1));
        assert_eq!(harness.changed(), vec![ValueData::Byte(0)]);

        // A different level is read back once before it is believed
        assert!(basic.handle_msg(&mut harness.ctx(command_class::BASIC), &[REPORT, 0x63], 1));
        assert_eq!(harness.sent_commands(), vec![vec![command_class::BASIC, GET]]);
        assert_eq!(harness.changed().len(), 1);
    }

    #[test]
    fn test_basic_set_is_node_event() {
        let mut harness = Harness::new();
        let mut basic = Basic;

        assert!(basic.handle_msg(&mut harness.ctx(command_class::BASIC), &[SET, 0xFF], 1));
        assert!(matches!(
            harness.out.notifications.as_slice(),
            [Notification::NodeEvent { event: 0xFF, .. }]
        ));
    }

    #[test]
    fn test_set_value() {
        let mut harness = Harness::new();
        let basic = Basic;
        basic.create_vars(&mut harness.ctx(command_class::BASIC), 1);
        let value = harness.values.find(command_class::BASIC, 1, 0).unwrap();

        assert!(basic.set_value(&mut harness.ctx(command_class::BASIC), &value, &ValueData::Byte(0x63)).unwrap());
        assert_eq!(harness.sent_commands(), vec![vec![command_class::BASIC, SET, 0x63]]);
    }
}
