//! Association (0x85)
//!
//! Groups are counted in the static stage and read in the association
//! stage. Long member lists arrive split over several reports.

use tracing::debug;
use zwrust_core::constants::command_class;
use zwrust_types::AssociationGroup;

use super::{CcContext, CommandClassHandler, Effect, RequestFlags};
use crate::driver::queue::MsgQueue;
use crate::error::Result;

const SET: u8 = 0x01;
const GET: u8 = 0x02;
const REPORT: u8 = 0x03;
const REMOVE: u8 = 0x04;
const GROUPINGS_GET: u8 = 0x05;
const GROUPINGS_REPORT: u8 = 0x06;

/// Read the members of groups `1..=count`
pub fn request_all_groups(ctx: &mut CcContext<'_>, count: u8, queue: MsgQueue) -> bool {
    let mut queued = false;
    for group in 1..=count {
        queued |= request_group(ctx, group, queue);
    }
    queued
}

pub fn request_group(ctx: &mut CcContext<'_>, group: u8, queue: MsgQueue) -> bool {
    ctx.send_request("AssociationCmd_Get", 1, &[GET, group], queue)
}

/// Add `node_id` to a group, then read the group back
pub fn add(ctx: &mut CcContext<'_>, group: u8, node_id: u8) -> Result<()> {
    let msg = ctx.command("AssociationCmd_Set", 1, &[SET, group, node_id])?;
    ctx.out.send(MsgQueue::Send, msg);
    request_group(ctx, group, MsgQueue::Send);
    Ok(())
}

/// Remove `node_id` from a group, then read the group back
pub fn remove(ctx: &mut CcContext<'_>, group: u8, node_id: u8) -> Result<()> {
    let msg = ctx.command("AssociationCmd_Remove", 1, &[REMOVE, group, node_id])?;
    ctx.out.send(MsgQueue::Send, msg);
    request_group(ctx, group, MsgQueue::Send);
    Ok(())
}

#[derive(Debug, Default)]
pub struct Association {
    /// Group whose report is split and not finished yet
    partial: Option<AssociationGroup>,
}

impl CommandClassHandler for Association {
    fn id(&self) -> u8 {
        command_class::ASSOCIATION
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_ASSOCIATION"
    }

    fn request_state(
        &self,
        ctx: &mut CcContext<'_>,
        flags: RequestFlags,
        instance: u8,
        queue: MsgQueue,
    ) -> bool {
        flags.contains(RequestFlags::STATIC)
            && ctx.send_request("AssociationCmd_GroupingsGet", instance, &[GROUPINGS_GET], queue)
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], _instance: u8) -> bool {
        match data {
            [GROUPINGS_REPORT, count, ..] => {
                debug!(node_id = ctx.node_id, count, "Association groups reported");
                ctx.effect(Effect::AssociationGroups(*count));
                true
            }
            [REPORT, group, max, to_follow, members @ ..] => {
                let mut current = match self.partial.take() {
                    Some(partial) if partial.index == *group => partial,
                    _ => AssociationGroup::new(*group, *max),
                };
                current.members.extend(members.iter().copied().filter(|&n| n != 0));

                if *to_follow > 0 {
                    self.partial = Some(current);
                } else {
                    debug!(node_id = ctx.node_id, group, members = ?current.members, "Association group reported");
                    ctx.effect(Effect::Association(current));
                }
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
    fn test_split_report() {
        let mut harness = Harness::new();
        let mut association = Association::default();

        association.handle_msg(&mut harness.ctx(command_class::ASSOCIATION), &[REPORT, 1, 5, 1, 1, 3], 1);
        assert!(harness.effects().is_empty());
        association.handle_msg(&mut harness.ctx(command_class::ASSOCIATION), &[REPORT, 1, 5, 0, 9], 1);

        let mut expected = AssociationGroup::new(1, 5);
        expected.members.extend([1, 3, 9]);
        assert_eq!(harness.effects(), vec![Effect::Association(expected)]);
    }

    #[test]
    fn test_groupings() {
        let mut harness = Harness::new();
        let mut association = Association::default();

        assert!(association.request_state(&mut harness.ctx(command_class::ASSOCIATION), RequestFlags::STATIC, 1, MsgQueue::Query));
        association.handle_msg(&mut harness.ctx(command_class::ASSOCIATION), &[GROUPINGS_REPORT, 3], 1);
        assert_eq!(harness.effects(), vec![Effect::AssociationGroups(3)]);

        harness.out.messages.clear();
        assert!(request_all_groups(&mut harness.ctx(command_class::ASSOCIATION), 3, MsgQueue::Query));
        assert_eq!(harness.out.messages.len(), 3);
    }

    #[test]
    fn test_add_reads_back() {
        let mut harness = Harness::new();
        add(&mut harness.ctx(command_class::ASSOCIATION), 2, 1).unwrap();
        remove(&mut harness.ctx(command_class::ASSOCIATION), 2, 4).unwrap();

        assert_eq!(
            harness.sent_commands(),
            vec![
                vec![command_class::ASSOCIATION, SET, 2, 1],
                vec![command_class::ASSOCIATION, GET, 2],
                vec![command_class::ASSOCIATION, REMOVE, 2, 4],
                vec![command_class::ASSOCIATION, GET, 2],
            ]
        );
    }
}
