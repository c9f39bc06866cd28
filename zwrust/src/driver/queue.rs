//! Prioritised send queues

use std::collections::VecDeque;
use std::fmt;

use zwrust_core::Message;
use zwrust_types::{QueryStage, ValueId};

/// Send queues, highest priority first
///
/// A non-empty queue always pre-empts every queue after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MsgQueue {
    /// Controller commands issued by the application
    Command,
    /// Nonce traffic of secure transmissions
    Security,
    /// Controller initialisation and housekeeping
    Controller,
    /// Traffic released by a node waking up
    WakeUp,
    /// Value sets and ad hoc requests
    Send,
    /// Discovery
    Query,
    /// Polling
    Poll,
}

impl MsgQueue {
    pub const ALL: [MsgQueue; 7] = [
        Self::Command,
        Self::Security,
        Self::Controller,
        Self::WakeUp,
        Self::Send,
        Self::Query,
        Self::Poll,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MsgQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Entry of a send queue
#[derive(Debug, Clone)]
pub enum QueueItem {
    /// Message to transmit; `set_value` is confirmed once it succeeds
    Send {
        msg: Box<Message>,
        set_value: Option<ValueId>,
    },
    /// Reaching this entry means every earlier request of the stage finished
    StageComplete { node_id: u8, stage: QueryStage },
}

impl QueueItem {
    pub fn message(msg: Message) -> Self {
        Self::Send {
            msg: Box::new(msg),
            set_value: None,
        }
    }

    /// Node the entry belongs to
    pub fn node_id(&self) -> u8 {
        match self {
            Self::Send { msg, .. } => msg.target_node_id(),
            Self::StageComplete { node_id, .. } => *node_id,
        }
    }

    pub fn is_stage_marker(&self) -> bool {
        matches!(self, Self::StageComplete { .. })
    }
}

/// The seven send queues of a driver
#[derive(Debug, Default)]
pub struct MsgQueues {
    queues: [VecDeque<QueueItem>; 7],
}

impl MsgQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    ///
    /// Discovery requests for a node whose stage marker is already queued
    /// go in front of that marker, so follow-up requests a reply triggers
    /// still belong to the running stage.
    pub fn push(&mut self, queue: MsgQueue, item: QueueItem) {
        if queue == MsgQueue::Query && !item.is_stage_marker() {
            let node_id = item.node_id();
            for q in &mut self.queues {
                if let Some(pos) = q
                    .iter()
                    .position(|i| i.is_stage_marker() && i.node_id() == node_id)
                {
                    q.insert(pos, item);
                    return;
                }
            }
        }
        self.queues[queue.index()].push_back(item);
    }

    /// Put an entry back at the head of its queue
    pub fn push_front(&mut self, queue: MsgQueue, item: QueueItem) {
        self.queues[queue.index()].push_front(item);
    }

    /// Take the head of the highest-priority non-empty queue
    pub fn pop(&mut self) -> Option<(MsgQueue, QueueItem)> {
        MsgQueue::ALL.iter().find_map(|&queue| {
            self.queues[queue.index()]
                .pop_front()
                .map(|item| (queue, item))
        })
    }

    /// Remove every entry for a node, in queue order
    pub fn drain_node(&mut self, node_id: u8) -> Vec<QueueItem> {
        let mut drained = Vec::new();
        for q in &mut self.queues {
            let (mine, rest): (VecDeque<_>, VecDeque<_>) =
                q.drain(..).partition(|i| i.node_id() == node_id);
            drained.extend(mine);
            *q = rest;
        }
        drained
    }

    /// Remove the stage markers of a node
    pub fn remove_stage_markers(&mut self, node_id: u8) -> usize {
        let mut removed = 0;
        for q in &mut self.queues {
            let before = q.len();
            q.retain(|i| !(i.is_stage_marker() && i.node_id() == node_id));
            removed += before - q.len();
        }
        removed
    }

    /// Whether anything is queued for a node
    pub fn has_node(&self, node_id: u8) -> bool {
        self.queues.iter().flatten().any(|i| i.node_id() == node_id)
    }

    pub fn len(&self, queue: MsgQueue) -> usize {
        self.queues[queue.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn clear(&mut self) {
        self.queues.iter_mut().for_each(VecDeque::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use zwrust_core::constants::command_class;

    fn basic_get(node: u8) -> QueueItem {
        QueueItem::message(Message::send_data("BasicCmd_Get", node, command_class::BASIC, &[0x02]))
    }

    fn marker(node_id: u8) -> QueueItem {
        QueueItem::StageComplete {
            node_id,
            stage: QueryStage::Static,
        }
    }

    #[test]
    fn test_priority_order() {
        let mut queues = MsgQueues::new();
        queues.push(MsgQueue::Poll, basic_get(1));
        queues.push(MsgQueue::Send, basic_get(2));
        queues.push(MsgQueue::Command, basic_get(3));

        let order: Vec<(MsgQueue, u8)> = std::iter::from_fn(|| queues.pop())
            .map(|(q, i)| (q, i.node_id()))
            .collect();

        assert_eq!(
            order,
            vec![(MsgQueue::Command, 3), (MsgQueue::Send, 2), (MsgQueue::Poll, 1)]
        );
    }

    #[test]
    fn test_follow_up_lands_before_marker() {
        let mut queues = MsgQueues::new();
        queues.push(MsgQueue::Query, basic_get(5));
        queues.push(MsgQueue::Query, marker(5));
        queues.push(MsgQueue::Query, marker(6));
        queues.push(MsgQueue::Query, basic_get(5));

        let order: Vec<bool> = std::iter::from_fn(|| queues.pop())
            .map(|(_, i)| i.is_stage_marker())
            .collect();
        assert_eq!(order, vec![false, false, true, true]);
    }

    #[test]
    fn test_drain_node() {
        let mut queues = MsgQueues::new();
        queues.push(MsgQueue::Send, basic_get(5));
        queues.push(MsgQueue::Query, basic_get(6));
        queues.push(MsgQueue::Query, marker(5));

        let drained = queues.drain_node(5);
        assert_eq!(drained.len(), 2);
        assert!(!queues.has_node(5));
        assert!(queues.has_node(6));

        assert_eq!(queues.remove_stage_markers(6), 0);
        assert_eq!(queues.len(MsgQueue::Query), 1);
    }
}
