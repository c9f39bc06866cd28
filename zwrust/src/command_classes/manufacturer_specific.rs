//! Manufacturer Specific (0x72)

use tracing::{info, warn};
use zwrust_core::constants::command_class;
use zwrust_types::ManufacturerInfo;

use super::{CcContext, CommandClassHandler, Effect};
use crate::driver::queue::MsgQueue;

const GET: u8 = 0x04;
const REPORT: u8 = 0x05;

/// Ask the node who made it; discovery issues this once
pub fn request_identity(ctx: &mut CcContext<'_>, queue: MsgQueue) -> bool {
    ctx.send_request("ManufacturerSpecificCmd_Get", 1, &[GET], queue)
}

#[derive(Debug, Default)]
pub struct ManufacturerSpecific;

impl CommandClassHandler for ManufacturerSpecific {
    fn id(&self) -> u8 {
        command_class::MANUFACTURER_SPECIFIC
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_MANUFACTURER_SPECIFIC"
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], _instance: u8) -> bool {
        let [REPORT, ids @ ..] = data else {
            return false;
        };
        let identity = match ManufacturerInfo::parse(ids) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(node_id = ctx.node_id, "Bad manufacturer report: {}", e);
                return false;
            }
        };

        let identity = match ctx.collaborators.products.get_product(
            identity.manufacturer_id,
            identity.product_type,
            identity.product_id,
        ) {
            Some(product) => identity.with_product(&product),
            None => identity,
        };
        info!(node_id = ctx.node_id, "Manufacturer: {}", identity);
        ctx.effect(Effect::Manufacturer(identity));
        true
    }
}
