//! No Operation (0x00)
//!
//! Carries no commands. Sending it checks that a node is reachable.

use zwrust_core::constants::command_class;
use zwrust_core::Message;

use super::{CcContext, CommandClassHandler};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct NoOperation;

impl NoOperation {
    /// Ping frame for the node
    pub fn ping(ctx: &CcContext<'_>) -> Result<Message> {
        ctx.command("NoOperation_Set", 1, &[])
    }
}

impl CommandClassHandler for NoOperation {
    fn id(&self) -> u8 {
        command_class::NO_OPERATION
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_NO_OPERATION"
    }

    fn handle_msg(&mut self, _ctx: &mut CcContext<'_>, _data: &[u8], _instance: u8) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_classes::testing::Harness;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ping_frame() {
        let mut harness = Harness::new();
        let msg = NoOperation::ping(&harness.ctx(command_class::NO_OPERATION)).unwrap();

        assert!(msg.is_no_operation());
        assert_eq!(msg.command_payload(), Some(&[0x00][..]));
    }
}
