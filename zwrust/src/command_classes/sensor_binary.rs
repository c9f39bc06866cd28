//! Sensor Binary (0x30)

use zwrust_core::constants::command_class;
use zwrust_types::{ValueGenre, ValueType};

use super::{CcContext, CommandClassHandler, RequestFlags};
use crate::driver::queue::MsgQueue;
use crate::value::{Value, ValueData};

const GET: u8 = 0x02;
const REPORT: u8 = 0x03;

#[derive(Debug, Default)]
pub struct SensorBinary;

impl CommandClassHandler for SensorBinary {
    fn id(&self) -> u8 {
        command_class::SENSOR_BINARY
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_SENSOR_BINARY"
    }

    fn create_vars(&self, ctx: &mut CcContext<'_>, instance: u8) {
        if let Ok(id) = ctx.value_id(ValueGenre::User, instance, 0, ValueType::Bool) {
            let label = ctx.label("sensor_binary.sensor", "Sensor");
            ctx.add_value(Value::new(id, label).read_only());
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
        ctx.send_request("SensorBinaryCmd_Get", instance, &[GET], queue)
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_classes::testing::Harness;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sensor_report() {
        let mut harness = Harness::new();
        let mut sensor = SensorBinary;
        sensor.create_vars(&mut harness.ctx(command_class::SENSOR_BINARY), 1);

        assert!(sensor.handle_msg(&mut harness.ctx(command_class::SENSOR_BINARY), &[REPORT, 0xFF], 1));
        assert_eq!(harness.changed(), vec![ValueData::Bool(true)]);

        let value = harness.values.find(command_class::SENSOR_BINARY, 1, 0).unwrap();
        assert!(value.is_read_only());
    }
}
