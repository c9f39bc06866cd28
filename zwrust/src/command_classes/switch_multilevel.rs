//! Switch Multilevel (0x26)
//!
//! Level 0 is off, 1-99 dims, 0xFF restores the last level. The Bright
//! and Dim buttons ramp the level while pressed.

use zwrust_core::constants::command_class;
use zwrust_types::{ValueGenre, ValueType};

use super::{CcContext, CommandClassHandler, RequestFlags};
use crate::driver::queue::MsgQueue;
use crate::error::Result;
use crate::value::{Affects, Value, ValueData};

const SET: u8 = 0x01;
const GET: u8 = 0x02;
const REPORT: u8 = 0x03;
const START_LEVEL_CHANGE: u8 = 0x04;
const STOP_LEVEL_CHANGE: u8 = 0x05;

const LEVEL: u8 = 0;
const DURATION: u8 = 1;
const BRIGHT: u8 = 2;
const DIM: u8 = 3;

const DIRECTION_UP: u8 = 0x00;
const DIRECTION_DOWN: u8 = 0x40;
const IGNORE_START_LEVEL: u8 = 0x20;

/// Let the device pick its default dimming duration
const DEFAULT_DURATION: u8 = 0xFF;

#[derive(Debug, Default)]
pub struct SwitchMultilevel;

impl CommandClassHandler for SwitchMultilevel {
    fn id(&self) -> u8 {
        command_class::SWITCH_MULTILEVEL
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_SWITCH_MULTILEVEL"
    }

    fn max_version(&self) -> u8 {
        2
    }

    fn create_vars(&self, ctx: &mut CcContext<'_>, instance: u8) {
        if let Ok(id) = ctx.value_id(ValueGenre::User, instance, LEVEL, ValueType::Byte) {
            let label = ctx.label("switch_multilevel.level", "Level");
            ctx.add_value(Value::new(id, label).with_range(0, 0xFF));
        }
        for (index, key, default) in [
            (BRIGHT, "switch_multilevel.bright", "Bright"),
            (DIM, "switch_multilevel.dim", "Dim"),
        ] {
            if let Ok(id) = ctx.value_id(ValueGenre::User, instance, index, ValueType::Button) {
                let label = ctx.label(key, default);
                // Pressing or releasing moves the level, which is then read back
                ctx.add_value(
                    Value::new(id, label)
                        .write_only()
                        .with_affects(Affects::Indices(vec![LEVEL])),
                );
            }
        }
        if ctx.info.version >= 2 {
            if let Ok(id) = ctx.value_id(ValueGenre::System, instance, DURATION, ValueType::Byte) {
                let label = ctx.label("switch_multilevel.duration", "Dimming Duration");
                ctx.add_value(Value::new(id, label).with_units("seconds").write_only());
            }
        }
    }

    fn request_state(
        &self,
        ctx: &mut CcContext<'_>,
        flags: RequestFlags,
        instance: u8,
        queue: MsgQueue,
    ) -> bool {
        flags.contains(RequestFlags::DYNAMIC) && self.request_value(ctx, LEVEL, instance, queue)
    }

    fn request_value(&self, ctx: &mut CcContext<'_>, index: u8, instance: u8, queue: MsgQueue) -> bool {
        index == LEVEL && ctx.send_request("SwitchMultilevelCmd_Get", instance, &[GET], queue)
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], instance: u8) -> bool {
        match data {
            [REPORT, level, ..] => {
                self.update_value(ctx, instance, LEVEL, ValueData::Byte(*level));
                true
            }
            _ => false,
        }
    }

    fn set_value(&self, ctx: &mut CcContext<'_>, value: &Value, data: &ValueData) -> Result<bool> {
        let id = value.id();
        match (id.index, data) {
            (LEVEL, ValueData::Byte(level)) => {
                let msg = if ctx.info.version >= 2 {
                    let duration = stored_duration(ctx, id.instance);
                    ctx.command("SwitchMultilevelCmd_Set", id.instance, &[SET, *level, duration])?
                } else {
                    ctx.command("SwitchMultilevelCmd_Set", id.instance, &[SET, *level])?
                };
                ctx.send_set(msg, id);
                Ok(true)
            }
            (BRIGHT | DIM, ValueData::Button(true)) => {
                let direction = if id.index == BRIGHT { DIRECTION_UP } else { DIRECTION_DOWN };
                let mut command = vec![START_LEVEL_CHANGE, direction | IGNORE_START_LEVEL, 0];
                if ctx.info.version >= 2 {
                    command.push(stored_duration(ctx, id.instance));
                }
                let msg = ctx.command("SwitchMultilevelCmd_StartLevelChange", id.instance, &command)?;
                ctx.send_set(msg, id);
                Ok(true)
            }
            (BRIGHT | DIM, ValueData::Button(false)) => {
                let msg = ctx.command("SwitchMultilevelCmd_StopLevelChange", id.instance, &[STOP_LEVEL_CHANGE])?;
                ctx.send_set(msg, id);
                Ok(true)
            }
            (DURATION, ValueData::Byte(duration)) => {
                // Only stored; used by the next level change
                value.on_value_refreshed(ValueData::Byte(*duration))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn stored_duration(ctx: &CcContext<'_>, instance: u8) -> u8 {
    match ctx.value(instance, DURATION).map(|v| v.data()) {
        Some(ValueData::Byte(d)) if d != 0 => d,
        _ => DEFAULT_DURATION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_classes::testing::Harness;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_v1_set() {
        let mut harness = Harness::new();
        let dimmer = SwitchMultilevel;
        dimmer.create_vars(&mut harness.ctx(command_class::SWITCH_MULTILEVEL), 1);
        assert_eq!(harness.values.len(), 3);

        let level = harness.values.find(command_class::SWITCH_MULTILEVEL, 1, 0).unwrap();
        dimmer
            .set_value(&mut harness.ctx(command_class::SWITCH_MULTILEVEL), &level, &ValueData::Byte(40))
            .unwrap();

        assert_eq!(harness.sent_commands(), vec![vec![command_class::SWITCH_MULTILEVEL, SET, 40]]);
    }

    #[test]
    fn test_v2_set_uses_duration() {
        let mut harness = Harness::new();
        harness.info.version = 2;
        let dimmer = SwitchMultilevel;
        dimmer.create_vars(&mut harness.ctx(command_class::SWITCH_MULTILEVEL), 1);

        let duration = harness.values.find(command_class::SWITCH_MULTILEVEL, 1, 1).unwrap();
        dimmer
            .set_value(&mut harness.ctx(command_class::SWITCH_MULTILEVEL), &duration, &ValueData::Byte(5))
            .unwrap();
        assert!(harness.out.messages.is_empty());

        let level = harness.values.find(command_class::SWITCH_MULTILEVEL, 1, 0).unwrap();
        dimmer
            .set_value(&mut harness.ctx(command_class::SWITCH_MULTILEVEL), &level, &ValueData::Byte(99))
            .unwrap();
        assert_eq!(harness.sent_commands(), vec![vec![command_class::SWITCH_MULTILEVEL, SET, 99, 5]]);
    }

    #[test]
    fn test_buttons_ramp_level() {
        let mut harness = Harness::new();
        let dimmer = SwitchMultilevel;
        dimmer.create_vars(&mut harness.ctx(command_class::SWITCH_MULTILEVEL), 1);

        let bright = harness.values.find(command_class::SWITCH_MULTILEVEL, 1, BRIGHT).unwrap();
        let dim = harness.values.find(command_class::SWITCH_MULTILEVEL, 1, DIM).unwrap();
        assert!(bright.is_write_only());
        assert_eq!(bright.affects(), &Affects::Indices(vec![LEVEL]));

        let mut ctx = harness.ctx(command_class::SWITCH_MULTILEVEL);
        assert!(dimmer.set_value(&mut ctx, &bright, &ValueData::Button(true)).unwrap());
        assert!(dimmer.set_value(&mut ctx, &bright, &ValueData::Button(false)).unwrap());
        assert!(dimmer.set_value(&mut ctx, &dim, &ValueData::Button(true)).unwrap());
        assert_eq!(
            harness.sent_commands(),
            vec![
                vec![command_class::SWITCH_MULTILEVEL, START_LEVEL_CHANGE, 0x20, 0],
                vec![command_class::SWITCH_MULTILEVEL, STOP_LEVEL_CHANGE],
                vec![command_class::SWITCH_MULTILEVEL, START_LEVEL_CHANGE, 0x60, 0],
            ]
        );
    }

    #[test]
    fn test_v2_ramp_carries_duration() {
        let mut harness = Harness::new();
        harness.info.version = 2;
        let dimmer = SwitchMultilevel;
        dimmer.create_vars(&mut harness.ctx(command_class::SWITCH_MULTILEVEL), 1);

        let dim = harness.values.find(command_class::SWITCH_MULTILEVEL, 1, DIM).unwrap();
        dimmer
            .set_value(&mut harness.ctx(command_class::SWITCH_MULTILEVEL), &dim, &ValueData::Button(true))
            .unwrap();
        assert_eq!(
            harness.sent_commands(),
            vec![vec![command_class::SWITCH_MULTILEVEL, START_LEVEL_CHANGE, 0x60, 0, DEFAULT_DURATION]]
        );
    }

    #[test]
    fn test_report() {
        let mut harness = Harness::new();
        let mut dimmer = SwitchMultilevel;
        dimmer.create_vars(&mut harness.ctx(command_class::SWITCH_MULTILEVEL), 1);

        assert!(dimmer.handle_msg(&mut harness.ctx(command_class::SWITCH_MULTILEVEL), &[REPORT, 0x32], 1));
        assert_eq!(harness.changed(), vec![ValueData::Byte(0x32)]);
    }
}
