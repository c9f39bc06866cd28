//! Switch Binary (0x25)

use zwrust_core::constants::command_class;
use zwrust_types::{ValueGenre, ValueType};

use super::{CcContext, CommandClassHandler, RequestFlags};
use crate::driver::queue::MsgQueue;
use crate::error::Result;
use crate::value::{Value, ValueData};

const SET: u8 = 0x01;
const GET: u8 = 0x02;
const REPORT: u8 = 0x03;

#[derive(Debug, Default)]
pub struct SwitchBinary;

impl CommandClassHandler for SwitchBinary {
    fn id(&self) -> u8 {
        command_class::SWITCH_BINARY
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_SWITCH_BINARY"
    }

    fn create_vars(&self, ctx: &mut CcContext<'_>, instance: u8) {
        if let Ok(id) = ctx.value_id(ValueGenre::User, instance, 0, ValueType::Bool) {
            let label = ctx.label("switch_binary.switch", "Switch");
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
        ctx.send_request("SwitchBinaryCmd_Get", instance, &[GET], queue)
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], instance: u8) -> bool {
        match data {
            [REPORT, state, ..] => {
                self.update_value(ctx, instance, 0, ValueData::Bool(*state != 0));
                true
            }
            _ => false,
        }
    }

    fn set_value(&self, ctx: &mut CcContext<'_>, value: &Value, data: &ValueData) -> Result<bool> {
        let ValueData::Bool(on) = data else {
            return Ok(false);
        };
        let state = if *on { 0xFF } else { 0x00 };
        let msg = ctx.command("SwitchBinaryCmd_Set", value.id().instance, &[SET, state])?;
        ctx.send_set(msg, value.id());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_classes::testing::Harness;
    use crate::driver::queue::QueueItem;
    use pretty_assertions::assert_eq;
    use zwrust_core::Encapsulation;

    #[test]
    fn test_report_any_nonzero_is_on() {
        let mut harness = Harness::new();
        let mut switch = SwitchBinary;
        switch.create_vars(&mut harness.ctx(command_class::SWITCH_BINARY), 1);

        assert!(switch.handle_msg(&mut harness.ctx(command_class::SWITCH_BINARY), &[REPORT, 0x63], 1));
        assert_eq!(harness.changed(), vec![ValueData::Bool(true)]);
        assert!(!switch.handle_msg(&mut harness.ctx(command_class::SWITCH_BINARY), &[0x7F], 1));
    }

    #[test]
    fn test_set_second_instance() {
        let mut harness = Harness::new();
        let switch = SwitchBinary;
        switch.create_vars(&mut harness.ctx(command_class::SWITCH_BINARY), 2);
        let value = harness.values.find(command_class::SWITCH_BINARY, 2, 0).unwrap();

        switch
            .set_value(&mut harness.ctx(command_class::SWITCH_BINARY), &value, &ValueData::Bool(true))
            .unwrap();

        let (queue, item) = &harness.out.messages[0];
        assert_eq!(*queue, MsgQueue::Send);
        let QueueItem::Send { msg, set_value } = item else {
            panic!("expected a message");
        };
        assert_eq!(*set_value, Some(value.id()));
        assert_eq!(msg.encapsulation(), Encapsulation::MultiInstance { instance: 2 });
        assert_eq!(msg.command_payload(), Some(&[command_class::SWITCH_BINARY, SET, 0xFF][..]));
    }

    #[test]
    fn test_wrong_data_type_not_set() {
        let mut harness = Harness::new();
        let switch = SwitchBinary;
        switch.create_vars(&mut harness.ctx(command_class::SWITCH_BINARY), 1);
        let value = harness.values.find(command_class::SWITCH_BINARY, 1, 0).unwrap();

        assert!(!switch.set_value(&mut harness.ctx(command_class::SWITCH_BINARY), &value, &ValueData::Byte(1)).unwrap());
        assert!(harness.out.messages.is_empty());
    }
}
