//! Wake Up (0x84)
//!
//! Sleeping nodes announce when they are awake; the driver then flushes the
//! traffic parked for them and sends them back to sleep.

use tracing::{debug, info};
use zwrust_core::constants::command_class;
use zwrust_types::{ValueGenre, ValueType};

use super::{CcContext, CommandClassHandler, Effect, RequestFlags};
use crate::driver::queue::MsgQueue;
use crate::error::{Error, Result};
use crate::value::{Value, ValueData};

const INTERVAL_SET: u8 = 0x04;
const INTERVAL_GET: u8 = 0x05;
const INTERVAL_REPORT: u8 = 0x06;
const NOTIFICATION: u8 = 0x07;
pub const NO_MORE_INFORMATION: u8 = 0x08;

const INTERVAL: u8 = 0;

/// Longest interval the 24-bit field holds (seconds)
const MAX_INTERVAL: i64 = 0x00FF_FFFF;

/// Ask a sleeping node for its wake up interval
pub fn request_interval(ctx: &mut CcContext<'_>, queue: MsgQueue) -> bool {
    ctx.send_request("WakeUpCmd_IntervalGet", 1, &[INTERVAL_GET], queue)
}

fn interval_set(interval: u32, target: u8) -> [u8; 5] {
    let [_, a, b, c] = interval.to_be_bytes();
    [INTERVAL_SET, a, b, c, target]
}

#[derive(Debug, Default)]
pub struct WakeUp;

impl CommandClassHandler for WakeUp {
    fn id(&self) -> u8 {
        command_class::WAKE_UP
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_WAKE_UP"
    }

    fn create_vars(&self, ctx: &mut CcContext<'_>, instance: u8) {
        if let Ok(id) = ctx.value_id(ValueGenre::System, instance, INTERVAL, ValueType::Int) {
            let label = ctx.label("wake_up.interval", "Wake-up Interval");
            ctx.add_value(
                Value::new(id, label)
                    .with_units("Seconds")
                    .with_range(0, MAX_INTERVAL),
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
        flags.contains(RequestFlags::SESSION) && self.request_value(ctx, INTERVAL, instance, queue)
    }

    fn request_value(&self, ctx: &mut CcContext<'_>, index: u8, _instance: u8, queue: MsgQueue) -> bool {
        index == INTERVAL && request_interval(ctx, queue)
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], instance: u8) -> bool {
        match *data {
            [INTERVAL_REPORT, a, b, c, target, ..] => {
                let interval = u32::from_be_bytes([0, a, b, c]);
                debug!(node_id = ctx.node_id, interval, target, "Wake up interval reported");
                self.update_value(ctx, instance, INTERVAL, ValueData::Int(interval as i32));

                if target != ctx.controller_node_id {
                    info!(node_id = ctx.node_id, target, "Pointing wake up notifications at the controller");
                    if let Ok(msg) = ctx.command(
                        "WakeUpCmd_IntervalSet",
                        1,
                        &interval_set(interval, ctx.controller_node_id),
                    ) {
                        ctx.out.send(MsgQueue::WakeUp, msg);
                    }
                }
                true
            }
            [NOTIFICATION, ..] => {
                debug!(node_id = ctx.node_id, "Node is awake");
                ctx.effect(Effect::Awake);
                true
            }
            _ => false,
        }
    }

    fn set_value(&self, ctx: &mut CcContext<'_>, value: &Value, data: &ValueData) -> Result<bool> {
        let id = value.id();
        let ValueData::Int(seconds) = *data else {
            return Err(Error::TypeMismatch {
                id,
                expected: ValueType::Int,
                actual: data.value_type(),
            });
        };
        let msg = ctx.command(
            "WakeUpCmd_IntervalSet",
            id.instance,
            &interval_set(seconds as u32, ctx.controller_node_id),
        )?;
        ctx.send_set(msg, id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_classes::testing::{CONTROLLER_ID, Harness};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_report_retargets_controller() {
        let mut harness = Harness::new();
        let mut wake_up = WakeUp;
        wake_up.create_vars(&mut harness.ctx(command_class::WAKE_UP), 1);

        assert!(wake_up.handle_msg(&mut harness.ctx(command_class::WAKE_UP), &[INTERVAL_REPORT, 0x00, 0x0E, 0x10, 0x09], 1));

        assert_eq!(harness.changed(), vec![ValueData::Int(3600)]);
        assert_eq!(
            harness.sent_commands(),
            vec![vec![command_class::WAKE_UP, INTERVAL_SET, 0x00, 0x0E, 0x10, CONTROLLER_ID]]
        );
    }

    #[test]
    fn test_report_for_controller_sends_nothing() {
        let mut harness = Harness::new();
        let mut wake_up = WakeUp;
        wake_up.create_vars(&mut harness.ctx(command_class::WAKE_UP), 1);

        wake_up.handle_msg(&mut harness.ctx(command_class::WAKE_UP), &[INTERVAL_REPORT, 0, 0, 60, CONTROLLER_ID], 1);
        assert!(harness.sent_commands().is_empty());
    }

    #[test]
    fn test_notification_wakes_node() {
        let mut harness = Harness::new();
        let mut wake_up = WakeUp;
        assert!(wake_up.handle_msg(&mut harness.ctx(command_class::WAKE_UP), &[NOTIFICATION], 1));
        assert_eq!(harness.effects(), vec![Effect::Awake]);
    }

    #[test]
    fn test_set_interval() {
        let mut harness = Harness::new();
        let wake_up = WakeUp;
        wake_up.create_vars(&mut harness.ctx(command_class::WAKE_UP), 1);
        let interval = harness.values.find(command_class::WAKE_UP, 1, INTERVAL).unwrap();

        wake_up
            .set_value(&mut harness.ctx(command_class::WAKE_UP), &interval, &ValueData::Int(1800))
            .unwrap();
        assert_eq!(
            harness.sent_commands(),
            vec![vec![command_class::WAKE_UP, INTERVAL_SET, 0x00, 0x07, 0x08, CONTROLLER_ID]]
        );
    }
}
