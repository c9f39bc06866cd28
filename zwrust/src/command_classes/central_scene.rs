//! Central Scene (0x5B)

use tracing::debug;
use zwrust_core::constants::command_class;
use zwrust_types::{ValueGenre, ValueType};

use super::{CcContext, CommandClassHandler, RequestFlags};
use crate::driver::queue::MsgQueue;
use crate::notification::Notification;
use crate::value::{Value, ValueData};

const SUPPORTED_GET: u8 = 0x01;
const SUPPORTED_REPORT: u8 = 0x02;
const NOTIFICATION: u8 = 0x03;

const SCENE_COUNT: u8 = 0;

#[derive(Debug, Default)]
pub struct CentralScene {
    /// Sequence number of the last notification, to drop retransmissions
    last_sequence: Option<u8>,
}

impl CommandClassHandler for CentralScene {
    fn id(&self) -> u8 {
        command_class::CENTRAL_SCENE
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_CENTRAL_SCENE"
    }

    fn create_vars(&self, ctx: &mut CcContext<'_>, instance: u8) {
        if let Ok(id) = ctx.value_id(ValueGenre::User, instance, SCENE_COUNT, ValueType::Byte) {
            let label = ctx.label("central_scene.count", "Scene Count");
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
        flags.contains(RequestFlags::STATIC) && self.request_value(ctx, SCENE_COUNT, instance, queue)
    }

    fn request_value(&self, ctx: &mut CcContext<'_>, index: u8, instance: u8, queue: MsgQueue) -> bool {
        index == SCENE_COUNT
            && ctx.send_request("CentralSceneCmd_SupportedGet", instance, &[SUPPORTED_GET], queue)
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], instance: u8) -> bool {
        match *data {
            [SUPPORTED_REPORT, count, ..] => {
                self.update_value(ctx, instance, SCENE_COUNT, ValueData::Byte(count));
                true
            }
            [NOTIFICATION, sequence, key_attributes, scene, ..] => {
                if self.last_sequence == Some(sequence) {
                    debug!(node_id = ctx.node_id, sequence, "Repeated scene notification dropped");
                    return true;
                }
                self.last_sequence = Some(sequence);
                debug!(node_id = ctx.node_id, scene, key_attributes, "Scene activated");
                ctx.notify(Notification::CentralScene {
                    home_id: ctx.home_id,
                    node_id: ctx.node_id,
                    scene,
                    key_attributes: key_attributes & 0x07,
                });
                true
            }
            _ => false,
        }
    }
}
