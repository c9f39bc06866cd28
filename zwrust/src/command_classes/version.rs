//! Version (0x86)

use tracing::{debug, info};
use zwrust_core::constants::command_class;
use zwrust_types::{ValueGenre, ValueType};

use super::{CcContext, CommandClassHandler, Effect, RequestFlags};
use crate::driver::queue::MsgQueue;
use crate::value::{Value, ValueData};

const GET: u8 = 0x11;
const REPORT: u8 = 0x12;
const COMMAND_CLASS_GET: u8 = 0x13;
const COMMAND_CLASS_REPORT: u8 = 0x14;

const LIBRARY: u8 = 0;
const PROTOCOL: u8 = 1;
const APPLICATION: u8 = 2;

/// Ask for the version of each class in `classes`
pub fn request_class_versions(ctx: &mut CcContext<'_>, classes: &[u8], queue: MsgQueue) -> bool {
    let mut queued = false;
    for &class in classes {
        queued |= ctx.send_request(
            "VersionCmd_CommandClassGet",
            1,
            &[COMMAND_CLASS_GET, class],
            queue,
        );
    }
    queued
}

#[derive(Debug, Default)]
pub struct Version;

impl CommandClassHandler for Version {
    fn id(&self) -> u8 {
        command_class::VERSION
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_VERSION"
    }

    fn create_vars(&self, ctx: &mut CcContext<'_>, instance: u8) {
        for (index, key, default) in [
            (LIBRARY, "version.library", "Library Version"),
            (PROTOCOL, "version.protocol", "Protocol Version"),
            (APPLICATION, "version.application", "Application Version"),
        ] {
            if let Ok(id) = ctx.value_id(ValueGenre::System, instance, index, ValueType::String) {
                let label = ctx.label(key, default);
                ctx.add_value(Value::new(id, label).read_only());
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
        flags.contains(RequestFlags::STATIC) && ctx.send_request("VersionCmd_Get", instance, &[GET], queue)
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], instance: u8) -> bool {
        match *data {
            [REPORT, library, protocol, protocol_sub, application, application_sub, ..] => {
                info!(
                    node_id = ctx.node_id,
                    library, "Firmware {}.{:02}, protocol {}.{:02}", application, application_sub, protocol, protocol_sub
                );
                self.update_value(ctx, instance, LIBRARY, ValueData::String(library.to_string()));
                self.update_value(
                    ctx,
                    instance,
                    PROTOCOL,
                    ValueData::String(format!("{}.{:02}", protocol, protocol_sub)),
                );
                self.update_value(
                    ctx,
                    instance,
                    APPLICATION,
                    ValueData::String(format!("{}.{:02}", application, application_sub)),
                );
                true
            }
            [COMMAND_CLASS_REPORT, class, version, ..] => {
                debug!(node_id = ctx.node_id, "Class 0x{:02X} is version {}", class, version);
                ctx.effect(Effect::ClassVersion {
                    command_class_id: class,
                    version,
                });
                true
            }
            _ => false,
        }
    }
}
