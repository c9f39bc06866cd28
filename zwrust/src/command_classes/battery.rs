//! Battery (0x80)

use tracing::warn;
use zwrust_core::constants::command_class;
use zwrust_types::{ValueGenre, ValueType};

use super::{CcContext, CommandClassHandler, RequestFlags};
use crate::driver::queue::MsgQueue;
use crate::value::{Value, ValueData};

const GET: u8 = 0x02;
const REPORT: u8 = 0x03;

/// Reported level meaning "battery low"
const LOW_BATTERY_WARNING: u8 = 0xFF;

#[derive(Debug, Default)]
pub struct Battery;

impl CommandClassHandler for Battery {
    fn id(&self) -> u8 {
        command_class::BATTERY
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_BATTERY"
    }

    fn create_vars(&self, ctx: &mut CcContext<'_>, instance: u8) {
        if let Ok(id) = ctx.value_id(ValueGenre::User, instance, 0, ValueType::Byte) {
            let label = ctx.label("battery.level", "Battery Level");
            ctx.add_value(
                Value::new(id, label)
                    .with_units("%")
                    .with_range(0, 100)
                    .read_only(),
            );
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
        ctx.send_request("BatteryCmd_Get", instance, &[GET], queue)
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], instance: u8) -> bool {
        let [REPORT, level, ..] = data else {
            return false;
        };
        let level = if *level == LOW_BATTERY_WARNING {
            warn!(node_id = ctx.node_id, "Low battery");
            0
        } else {
            (*level).min(100)
        };
        self.update_value(ctx, instance, 0, ValueData::Byte(level));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_classes::testing::Harness;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_low_battery_warning_is_zero() {
        let mut harness = Harness::new();
        let mut battery = Battery;
        battery.create_vars(&mut harness.ctx(command_class::BATTERY), 1);

        assert!(battery.handle_msg(&mut harness.ctx(command_class::BATTERY), &[REPORT, 0xFF], 1));
        assert_eq!(harness.changed(), vec![ValueData::Byte(0)]);
    }

    #[test]
    fn test_dynamic_request() {
        let mut harness = Harness::new();
        let battery = Battery;

        assert!(!battery.request_state(
            &mut harness.ctx(command_class::BATTERY),
            RequestFlags::STATIC,
            1,
            MsgQueue::Query
        ));
        assert!(battery.request_state(
            &mut harness.ctx(command_class::BATTERY),
            RequestFlags::DYNAMIC,
            1,
            MsgQueue::Query
        ));
        assert_eq!(harness.sent_commands(), vec![vec![command_class::BATTERY, GET]]);
    }
}
