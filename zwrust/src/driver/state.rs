//! Driver state machine
//!
//! [`DriverState`] holds everything the driver knows: nodes, send queues,
//! the transaction in flight and the security bookkeeping. It performs no
//! I/O. The async loop feeds it link events and timer ticks, then carries
//! out whatever it left in its [`Outputs`].
//!
//! # Transactions
//!
//! One message is in flight at a time. It is finished once the controller
//! acknowledged it, its callback (if any) arrived, and the reply it expects
//! (a response, an application update or a command class report from the
//! target node) was seen. A NAK, CAN, failed callback or timeout sends it
//! again with a fresh callback id until its attempts run out.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use rand::{rngs::StdRng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use zwrust_core::constants::{
    command_class, security, transmit_status, update_state, ACK, MAX_TRIES, NAK, NODE_BROADCAST,
};
use zwrust_core::{
    CallbackIds, Frame, Function, Incoming, Message, MessageType, NonceTable, SecureFrame, SecurityKeys,
};
use zwrust_types::{NetworkSnapshot, NodeProtocolInfo, QueryStage, ValueId};

use super::queue::{MsgQueue, MsgQueues, QueueItem};
use crate::command_classes::{wake_up, CommandClassRegistry, Effect, Outbox};
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::node::{node_ids_from_bitmap, Node, NodeEnv};
use crate::notification::{ErrorCode, Notification};
use crate::product::{Collaborators, Localization, ProductDatabase};
use crate::value::ValueData;

/// What the async loop must do after a state call
#[derive(Debug, Default)]
pub struct Outputs {
    /// Bytes to write to the link, in order
    pub writes: Vec<Bytes>,
    pub notifications: Vec<Notification>,
    /// Snapshot to persist
    pub save: Option<NetworkSnapshot>,
    /// Home id whose snapshot should be loaded
    pub load: Option<u32>,
}

impl Outputs {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
            && self.notifications.is_empty()
            && self.save.is_none()
            && self.load.is_none()
    }
}

/// Driver-wide parts every node call borrows
struct Shared {
    registry: CommandClassRegistry,
    collaborators: Collaborators,
    security_enabled: bool,
    max_attempts: u8,
}

impl Shared {
    fn env(&self, controller_node_id: u8) -> NodeEnv<'_> {
        NodeEnv {
            controller_node_id,
            registry: &self.registry,
            collaborators: &self.collaborators,
            security_enabled: self.security_enabled,
            max_attempts: self.max_attempts,
        }
    }
}

/// The message in flight
#[derive(Debug)]
struct Transaction {
    queue: MsgQueue,
    /// Clear text message; secure messages are sealed again on every attempt
    msg: Box<Message>,
    set_value: Option<ValueId>,
    node_id: u8,
    waiting_for_ack: bool,
    /// Outstanding callback id, 0 when none
    callback_id: u8,
    expected_reply: Option<Function>,
    expected_cc: u8,
    deadline: Instant,
}

impl Transaction {
    fn is_done(&self) -> bool {
        !self.waiting_for_ack && self.callback_id == 0 && self.expected_reply.is_none()
    }

    fn into_item(self) -> (MsgQueue, QueueItem) {
        (
            self.queue,
            QueueItem::Send {
                msg: self.msg,
                set_value: self.set_value,
            },
        )
    }
}

fn is_nonce_get(msg: &Message) -> bool {
    matches!(
        msg.command_payload(),
        Some([command_class::SECURITY, security::NONCE_GET])
    )
}

/// Pure state of a driver
pub struct DriverState {
    config: DriverConfig,
    shared: Shared,
    home_id: u32,
    controller_node_id: u8,
    nodes: BTreeMap<u8, Node>,
    queues: MsgQueues,
    current: Option<Transaction>,
    callbacks: CallbackIds,
    keys: Option<SecurityKeys>,
    nonces: NonceTable,
    rng: StdRng,
    /// Secure messages held until the node sends a nonce
    awaiting_nonce: BTreeMap<u8, VecDeque<QueueItem>>,
    /// Loaded snapshot, applied to nodes as they appear
    snapshot: Option<NetworkSnapshot>,
    ready: bool,
    all_queried: bool,
    poll_round: u32,
    next_poll: Instant,
    /// `(node, class)` pairs accepted since the last frame
    handled: Vec<(u8, u8)>,
    outputs: Outputs,
}

impl DriverState {
    pub fn new(config: DriverConfig, mut collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let keys = config
            .network_key
            .as_ref()
            .map(SecurityKeys::derive)
            .transpose()?;
        collaborators.language = config.language.clone();

        Ok(Self {
            shared: Shared {
                registry: CommandClassRegistry::with_defaults(),
                collaborators,
                security_enabled: keys.is_some(),
                max_attempts: config.max_attempts,
            },
            home_id: 0,
            controller_node_id: 0,
            nodes: BTreeMap::new(),
            queues: MsgQueues::new(),
            current: None,
            callbacks: CallbackIds::new(),
            keys,
            nonces: NonceTable::new(),
            rng: StdRng::from_entropy(),
            awaiting_nonce: BTreeMap::new(),
            snapshot: None,
            ready: false,
            all_queried: false,
            poll_round: 0,
            next_poll: Instant::now() + config.poll_interval,
            handled: Vec::new(),
            outputs: Outputs::default(),
            config,
        })
    }

    pub fn set_product_database(&mut self, products: Arc<dyn ProductDatabase>) {
        self.shared.collaborators.products = products;
    }

    pub fn set_localization(&mut self, localization: Arc<dyn Localization>) {
        self.shared.collaborators.localization = localization;
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn home_id(&self) -> u32 {
        self.home_id
    }

    pub fn controller_node_id(&self) -> u8 {
        self.controller_node_id
    }

    /// Controller initialised and nodes known
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn node(&self, node_id: u8) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> Vec<u8> {
        self.nodes.keys().copied().collect()
    }

    /// Whether a transaction is in flight
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn take_outputs(&mut self) -> Outputs {
        std::mem::take(&mut self.outputs)
    }

    /// Earliest instant [`on_tick`](Self::on_tick) has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let poll = self.ready.then_some(self.next_poll);
        match (self.current.as_ref().map(|t| t.deadline), poll) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Current network state in persisted form; `None` before the home id
    /// is known
    pub fn snapshot(&self) -> Option<NetworkSnapshot> {
        if self.home_id == 0 {
            return None;
        }
        let mut snapshot = NetworkSnapshot::new(self.home_id, self.controller_node_id);
        snapshot.nodes = self.nodes.values().map(Node::to_snapshot).collect();
        Some(snapshot)
    }

    /// Use what an earlier run learned about this network
    pub fn apply_snapshot(&mut self, snapshot: NetworkSnapshot) {
        if snapshot.home_id != self.home_id {
            warn!(
                saved = format_args!("0x{:08X}", snapshot.home_id),
                home_id = format_args!("0x{:08X}", self.home_id),
                "Ignoring snapshot of another network"
            );
            return;
        }
        info!(nodes = snapshot.nodes.len(), "Snapshot loaded");
        let known: Vec<u8> = snapshot
            .nodes
            .iter()
            .map(|n| n.node_id)
            .filter(|id| self.nodes.contains_key(id))
            .collect();
        self.snapshot = Some(snapshot);
        for node_id in known {
            self.restore_node(node_id);
        }
    }

    // Link events

    /// Link (re)opened: initialise the controller
    pub fn on_link_opened(&mut self) {
        info!("Link open, initialising controller");
        let init = [
            ("Get Version", Function::GetVersion),
            ("Get Home/Node Id", Function::MemoryGetId),
            ("Get Controller Capabilities", Function::GetControllerCapabilities),
            ("Get Serial API Capabilities", Function::SerialApiGetCapabilities),
            ("Get Init Data", Function::SerialApiGetInitData),
        ];
        for (text, function) in init {
            let msg = Message::new(text, NODE_BROADCAST, MessageType::Request, function);
            self.queues.push(MsgQueue::Controller, QueueItem::message(msg));
        }
    }

    /// Link lost: the message in flight goes back to its queue
    pub fn on_link_closed(&mut self) {
        warn!("Link closed");
        if let Some(txn) = self.current.take() {
            let (queue, item) = txn.into_item();
            self.queues.push_front(queue, item);
        }
        self.notify(Notification::DriverReset {
            home_id: self.home_id,
        });
    }

    /// Garbage on the link
    pub fn on_malformed(&mut self, error: &zwrust_core::Error) {
        warn!("Malformed frame: {}", error);
        self.outputs.writes.push(Bytes::from_static(&[NAK]));
    }

    pub fn on_incoming(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::Ack => {
                if let Some(txn) = self.current.as_mut().filter(|t| t.waiting_for_ack) {
                    trace!(node_id = txn.node_id, "ACK");
                    txn.waiting_for_ack = false;
                }
            }
            Incoming::Nak => self.resend("NAK"),
            Incoming::Can => self.resend("CAN"),
            Incoming::Frame(frame) => {
                self.outputs.writes.push(Bytes::from_static(&[ACK]));
                self.on_frame(&frame);
            }
        }
        self.finish_if_done();
    }

    /// Handle timeouts, polling and nonce expiry
    pub fn on_tick(&mut self, now: Instant) {
        if let Some(txn) = self.current.take_if(|t| now >= t.deadline) {
            warn!(
                node_id = txn.node_id,
                attempt = txn.msg.send_attempts(),
                "Timeout waiting for {}",
                txn.msg.log_text()
            );
            self.retry(txn, ErrorCode::Timeout);
        }
        if self.ready && now >= self.next_poll {
            self.next_poll = now + self.config.poll_interval;
            self.poll();
        }
        self.nonces.purge_expired();
    }

    /// Start the next transaction if the link is free
    pub fn poll_send(&mut self, now: Instant) {
        while self.current.is_none() {
            self.queue_no_more_information();
            let Some((queue, item)) = self.queues.pop() else {
                return;
            };

            let node_id = item.node_id();
            if self.nodes.get(&node_id).is_some_and(|n| n.is_sleeping() && !n.is_awake()) {
                trace!(node_id, "Holding traffic for sleeping node");
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    node.park(item);
                }
                continue;
            }

            match item {
                QueueItem::StageComplete { node_id, stage } => {
                    self.with_node(node_id, |node, env, out| node.query_stage_complete(env, out, stage));
                }
                QueueItem::Send { msg, set_value } => self.transmit(queue, msg, set_value, now),
            }
        }
    }

    // Application requests

    pub fn set_value(&mut self, id: &ValueId, data: ValueData) -> Result<()> {
        self.with_node(id.node_id, |node, env, out| node.set_value(env, out, id, data))
            .ok_or(Error::NodeNotFound(id.node_id))?
    }

    /// Read a value again
    pub fn refresh_value(&mut self, id: &ValueId) -> Result<()> {
        let queued = self
            .with_node(id.node_id, |node, env, out| {
                node.value(id)
                    .map(|_| node.request_value(env, out, id, MsgQueue::Send))
            })
            .ok_or(Error::NodeNotFound(id.node_id))?
            .ok_or(Error::ValueNotFound(*id))?;
        if !queued {
            return Err(Error::UnsupportedCommandClass(id.command_class_id));
        }
        Ok(())
    }

    /// Poll a value every `intensity` rounds; 0 stops polling
    pub fn set_poll_intensity(&mut self, id: &ValueId, intensity: u8) -> Result<()> {
        let node = self.nodes.get(&id.node_id).ok_or(Error::NodeNotFound(id.node_id))?;
        let value = node.value(id).ok_or(Error::ValueNotFound(*id))?;
        value.set_poll_intensity(intensity);
        debug!(value = %id, intensity, "Poll intensity set");
        Ok(())
    }

    pub fn set_node_name(&mut self, node_id: u8, name: &str) -> Result<()> {
        self.with_node(node_id, |node, env, out| node.set_name(env, out, name))
            .ok_or(Error::NodeNotFound(node_id))?
    }

    pub fn set_node_location(&mut self, node_id: u8, location: &str) -> Result<()> {
        self.with_node(node_id, |node, env, out| node.set_location(env, out, location))
            .ok_or(Error::NodeNotFound(node_id))?
    }

    pub fn add_association(&mut self, node_id: u8, group: u8, target: u8) -> Result<()> {
        self.with_node(node_id, |node, env, out| node.add_association(env, out, group, target))
            .ok_or(Error::NodeNotFound(node_id))?
    }

    pub fn remove_association(&mut self, node_id: u8, group: u8, target: u8) -> Result<()> {
        self.with_node(node_id, |node, env, out| node.remove_association(env, out, group, target))
            .ok_or(Error::NodeNotFound(node_id))?
    }

    pub fn ping(&mut self, node_id: u8) -> Result<()> {
        self.with_node(node_id, |node, env, out| node.ping(env, out))
            .ok_or(Error::NodeNotFound(node_id))?
    }

    // Plumbing

    /// Run a node call and take over what it produced
    fn with_node<R>(
        &mut self,
        node_id: u8,
        f: impl FnOnce(&mut Node, &NodeEnv<'_>, &mut Outbox) -> R,
    ) -> Option<R> {
        let mut out = Outbox::new();
        let env = self.shared.env(self.controller_node_id);
        let node = self.nodes.get_mut(&node_id)?;
        let result = f(node, &env, &mut out);
        self.absorb(out);
        Some(result)
    }

    fn absorb(&mut self, out: Outbox) {
        let Outbox {
            messages,
            notifications,
            effects,
            handled,
        } = out;
        for (queue, item) in messages {
            self.queues.push(queue, item);
        }
        self.handled.extend(handled);
        for notification in notifications {
            self.notify(notification);
        }
        for (node_id, effect) in effects {
            self.security_effect(node_id, effect);
        }
    }

    fn notify(&mut self, notification: Notification) {
        let completed = matches!(notification, Notification::NodeQueriesComplete { .. });
        self.outputs.notifications.push(notification);
        if completed {
            self.outputs.save = self.snapshot();
            self.check_all_queried();
        }
    }

    fn check_all_queried(&mut self) {
        if self.all_queried
            || !self.ready
            || !self.nodes.values().all(|n| n.query_stage().is_complete())
        {
            return;
        }
        self.all_queried = true;
        info!(nodes = self.nodes.len(), "All nodes queried");
        self.outputs.notifications.push(Notification::AllNodesQueried {
            home_id: self.home_id,
        });
    }

    fn transmit(&mut self, queue: MsgQueue, mut msg: Box<Message>, set_value: Option<ValueId>, now: Instant) {
        let node_id = msg.target_node_id();
        if msg.send_attempts() == 0 && self.config.max_attempts != MAX_TRIES {
            msg.set_max_send_attempts(self.config.max_attempts);
        }
        if let Err(e) = msg.finalize(&self.callbacks) {
            warn!(node_id, "Dropped {}: {}", msg.log_text(), e);
            return;
        }

        let sealed = if msg.is_secure() {
            let Some(keys) = self.keys.as_ref() else {
                warn!(node_id, "No network key for {}", msg.log_text());
                self.secure_send_failed(node_id);
                return;
            };
            if self.awaiting_nonce.contains_key(&node_id) {
                self.park_for_nonce(node_id, QueueItem::Send { msg, set_value });
                return;
            }
            let Some(nonce) = self.nonces.take_received(node_id) else {
                debug!(node_id, "Requesting nonce for {}", msg.log_text());
                self.park_for_nonce(node_id, QueueItem::Send { msg, set_value });
                let get = Message::send_data(
                    "SecurityCmd_NonceGet",
                    node_id,
                    command_class::SECURITY,
                    &[security::NONCE_GET],
                )
                .expect_report(command_class::SECURITY);
                self.queues.push(MsgQueue::Security, QueueItem::message(get));
                return;
            };
            match SecureFrame::encapsulate(
                &msg,
                keys,
                self.controller_node_id,
                nonce,
                &mut self.rng,
                &self.callbacks,
            ) {
                Ok(sealed) => Some(sealed),
                Err(e) => {
                    warn!(node_id, "Could not encrypt {}: {}", msg.log_text(), e);
                    self.secure_send_failed(node_id);
                    return;
                }
            }
        } else {
            None
        };

        msg.set_send_attempts(msg.send_attempts() + 1);
        let wire: &Message = sealed.as_ref().unwrap_or(&*msg);
        let bytes = wire.to_bytes();
        let callback_id = if wire.callback_required() { wire.callback_id() } else { 0 };
        let expected_reply = wire.expected_reply();
        let expected_cc = wire.expected_command_class_id();
        debug!(
            node_id,
            %queue,
            attempt = msg.send_attempts(),
            callback_id,
            "Sending {}",
            wire.log_text()
        );
        trace!(frame = %hex::encode(&bytes), "Write");

        self.current = Some(Transaction {
            queue,
            msg,
            set_value,
            node_id,
            waiting_for_ack: true,
            callback_id,
            expected_reply,
            expected_cc,
            deadline: now + self.config.timeout,
        });
        self.outputs.writes.push(bytes);
    }

    fn park_for_nonce(&mut self, node_id: u8, item: QueueItem) {
        self.awaiting_nonce.entry(node_id).or_default().push_back(item);
    }

    fn secure_send_failed(&mut self, node_id: u8) {
        self.notify(Notification::Error {
            home_id: self.home_id,
            node_id,
            code: ErrorCode::Crypto,
        });
    }

    /// NAK or CAN: send the message in flight again
    fn resend(&mut self, reason: &str) {
        if let Some(txn) = self.current.take() {
            debug!(node_id = txn.node_id, "{} for {}", reason, txn.msg.log_text());
            self.retry(txn, ErrorCode::Failed);
        }
    }

    fn retry(&mut self, txn: Transaction, code: ErrorCode) {
        if txn.msg.send_attempts() >= txn.msg.max_send_attempts() {
            self.give_up(txn, code);
            return;
        }
        let (queue, mut item) = txn.into_item();
        if let QueueItem::Send { msg, .. } = &mut item {
            if let Err(e) = msg.update_callback_id(&self.callbacks) {
                warn!("Callback renewal failed: {}", e);
            }
        }
        self.queues.push_front(queue, item);
    }

    fn give_up(&mut self, txn: Transaction, code: ErrorCode) {
        let node_id = txn.node_id;
        warn!(
            node_id,
            attempts = txn.msg.send_attempts(),
            ?code,
            "Dropping {}",
            txn.msg.log_text()
        );

        if !self.ready && txn.queue == MsgQueue::Controller {
            self.notify(Notification::DriverFailed {
                reason: format!("{} failed", txn.msg.log_text()),
            });
            return;
        }

        self.notify(Notification::Error {
            home_id: self.home_id,
            node_id,
            code,
        });
        if txn.msg.function() == Function::RequestNodeInfo {
            self.node_info_failed(node_id);
        }
        if is_nonce_get(&txn.msg) {
            if let Some(parked) = self.awaiting_nonce.remove(&node_id) {
                warn!(node_id, dropped = parked.len(), "No nonce from node");
                self.secure_send_failed(node_id);
            }
        }
    }

    fn finish_if_done(&mut self) {
        let Some(txn) = self.current.take_if(|t| t.is_done()) else {
            return;
        };
        trace!(node_id = txn.node_id, "Completed {}", txn.msg.log_text());
        if txn.msg.is_wake_up_no_more_information() {
            if let Some(node) = self.nodes.get_mut(&txn.node_id) {
                debug!(node_id = txn.node_id, "Node back to sleep");
                node.set_asleep();
            }
        }
        if let Some(id) = txn.set_value {
            self.with_node(id.node_id, |node, env, out| node.confirm_set(env, out, &id));
        }
    }

    /// Send a sleeping node back to sleep once its traffic drained
    fn queue_no_more_information(&mut self) {
        let busy = self.current.as_ref().map(|t| t.node_id);
        let idle: Vec<u8> = self
            .nodes
            .keys()
            .copied()
            .filter(|&id| {
                Some(id) != busy && !self.queues.has_node(id) && !self.awaiting_nonce.contains_key(&id)
            })
            .collect();
        for node_id in idle {
            let due = self.nodes.get_mut(&node_id).is_some_and(Node::take_no_more_info);
            if due {
                let msg = Message::send_data(
                    "WakeUpCmd_NoMoreInformation",
                    node_id,
                    command_class::WAKE_UP,
                    &[wake_up::NO_MORE_INFORMATION],
                );
                self.queues.push(MsgQueue::WakeUp, QueueItem::message(msg));
            }
        }
    }

    fn poll(&mut self) {
        if self.queues.len(MsgQueue::Poll) > 0 {
            return;
        }
        self.poll_round = self.poll_round.wrapping_add(1);
        let round = self.poll_round;
        let ready: Vec<u8> = self
            .nodes
            .values()
            .filter(|n| n.query_stage().is_complete())
            .map(Node::node_id)
            .collect();
        for node_id in ready {
            self.with_node(node_id, |node, env, out| {
                for id in node.poll_due(round) {
                    node.request_value(env, out, &id, MsgQueue::Poll);
                }
            });
        }
    }

    // Frames

    fn on_frame(&mut self, frame: &Frame) {
        let function = match frame.function() {
            Ok(function) => function,
            Err(_) => {
                debug!("Unhandled function 0x{:02X}", frame.function);
                return;
            }
        };
        trace!(
            function = function.name(),
            response = frame.is_response(),
            payload = %hex::encode(&frame.payload),
            "Frame"
        );

        if frame.is_response() {
            self.on_response(function, &frame.payload);
        } else {
            self.on_request(function, &frame.payload);
        }
        self.match_reports();
    }

    fn on_response(&mut self, function: Function, payload: &[u8]) {
        match function {
            Function::GetVersion => {
                let text = payload.split(|&b| b == 0).next().unwrap_or_default();
                info!(version = %String::from_utf8_lossy(text), "Controller library");
            }
            Function::MemoryGetId => self.on_memory_id(payload),
            Function::GetControllerCapabilities => {
                debug!(capabilities = payload.first().copied().unwrap_or(0), "Controller capabilities");
            }
            Function::SerialApiGetCapabilities => {
                if let [major, minor, ..] = payload {
                    debug!("Serial API version {}.{}", major, minor);
                }
            }
            Function::SerialApiGetInitData => self.on_init_data(payload),
            Function::GetNodeProtocolInfo => self.on_protocol_info(payload),
            Function::GetRoutingInfo => {
                if let Some(node_id) = self.current_target(Function::GetRoutingInfo) {
                    if let Some(node) = self.nodes.get_mut(&node_id) {
                        node.set_neighbors(payload);
                    }
                }
            }
            Function::SendData | Function::RequestNodeInfo => {
                if payload.first() == Some(&0) {
                    if let Some(txn) = self.current.take_if(|t| t.msg.function() == function) {
                        warn!(node_id = txn.node_id, "Controller refused {}", txn.msg.log_text());
                        self.retry(txn, ErrorCode::Failed);
                    }
                    return;
                }
            }
            _ => debug!("Unhandled response {}", function.name()),
        }

        if let Some(txn) = self.current.as_mut() {
            if txn.expected_reply == Some(function) && txn.callback_id == 0 {
                txn.expected_reply = None;
            }
        }
    }

    fn on_request(&mut self, function: Function, payload: &[u8]) {
        match function {
            Function::SendData => self.on_send_data_callback(payload),
            Function::ApplicationCommandHandler => self.on_application_command(payload),
            Function::ApplicationUpdate => self.on_application_update(payload),
            _ => debug!("Unhandled request {}", function.name()),
        }
    }

    /// Node the transaction in flight targets, if it is a `function` request
    fn current_target(&self, function: Function) -> Option<u8> {
        self.current
            .as_ref()
            .filter(|t| t.msg.function() == function)
            .map(|t| t.node_id)
    }

    fn on_memory_id(&mut self, payload: &[u8]) {
        if payload.len() < 5 {
            warn!(len = payload.len(), "Short home id response");
            return;
        }
        self.home_id = BigEndian::read_u32(&payload[..4]);
        self.controller_node_id = payload[4];
        info!(
            home_id = format_args!("0x{:08X}", self.home_id),
            controller_node_id = self.controller_node_id,
            "Controller identified"
        );
        self.outputs.load = Some(self.home_id);
    }

    fn on_init_data(&mut self, payload: &[u8]) {
        let &[_version, _capabilities, len, ref bitmap @ ..] = payload else {
            warn!(len = payload.len(), "Short init data response");
            return;
        };
        let bitmap = &bitmap[..(len as usize).min(bitmap.len())];
        let node_ids = node_ids_from_bitmap(bitmap);

        if !self.ready {
            self.ready = true;
            info!(
                home_id = format_args!("0x{:08X}", self.home_id),
                nodes = node_ids.len(),
                "Driver ready"
            );
            self.notify(Notification::DriverReady {
                home_id: self.home_id,
                controller_node_id: self.controller_node_id,
            });
        }

        for &node_id in &node_ids {
            self.add_node(node_id);
        }
        for node_id in node_ids {
            self.with_node(node_id, |node, env, out| node.advance_queries(env, out));
        }
    }

    fn add_node(&mut self, node_id: u8) {
        if self.nodes.contains_key(&node_id) {
            return;
        }
        let node = Node::new(self.home_id, node_id).with_controller(node_id == self.controller_node_id);
        self.nodes.insert(node_id, node);
        debug!(node_id, "Node added");
        self.notify(Notification::NodeAdded {
            home_id: self.home_id,
            node_id,
        });
        self.restore_node(node_id);
    }

    fn restore_node(&mut self, node_id: u8) {
        let Some(saved) = self.snapshot.as_ref().and_then(|s| s.node(node_id)).cloned() else {
            return;
        };
        self.with_node(node_id, |node, env, out| node.restore(env, out, &saved));
    }

    fn on_protocol_info(&mut self, payload: &[u8]) {
        let Some(node_id) = self.current_target(Function::GetNodeProtocolInfo) else {
            return;
        };
        match NodeProtocolInfo::parse(payload) {
            Ok(info) => {
                self.with_node(node_id, |node, env, out| node.set_protocol_info(env, out, info));
            }
            Err(e) => warn!(node_id, "No protocol info: {}", e),
        }
    }

    fn on_send_data_callback(&mut self, payload: &[u8]) {
        let &[callback_id, status, ..] = payload else {
            warn!(len = payload.len(), "Short SendData callback");
            return;
        };
        if !self
            .current
            .as_ref()
            .is_some_and(|t| t.callback_id != 0 && t.callback_id == callback_id)
        {
            debug!(callback_id, "Stray callback");
            return;
        }

        if status == transmit_status::OK {
            if let Some(txn) = self.current.as_mut() {
                txn.callback_id = 0;
                if txn.expected_reply == Some(Function::SendData) {
                    txn.expected_reply = None;
                }
            }
            return;
        }

        let Some(txn) = self.current.take() else {
            return;
        };
        if status == transmit_status::NO_ACK
            && self.nodes.get(&txn.node_id).is_some_and(Node::is_sleeping)
        {
            self.node_fell_asleep(txn);
            return;
        }
        warn!(node_id = txn.node_id, status, "Transmission failed: {}", txn.msg.log_text());
        let code = if status == transmit_status::NO_ACK {
            ErrorCode::NoAck
        } else {
            ErrorCode::Failed
        };
        self.retry(txn, code);
    }

    /// A sleeping node did not answer: hold its traffic until it wakes
    fn node_fell_asleep(&mut self, txn: Transaction) {
        let node_id = txn.node_id;
        let mut held = Vec::new();
        if !txn.msg.is_wake_up_no_more_information() {
            let (_, mut item) = txn.into_item();
            if let QueueItem::Send { msg, .. } = &mut item {
                msg.set_send_attempts(0);
            }
            held.push(item);
        }
        held.extend(self.queues.drain_node(node_id));

        if let Some(node) = self.nodes.get_mut(&node_id) {
            info!(node_id, held = held.len(), "Node is asleep");
            node.set_asleep();
            for item in held {
                node.park(item);
            }
        }
    }

    fn on_application_command(&mut self, payload: &[u8]) {
        let &[_status, node_id, len, ref rest @ ..] = payload else {
            warn!(len = payload.len(), "Short application command");
            return;
        };
        let command = &rest[..(len as usize).min(rest.len())];
        let Some((&command_class_id, data)) = command.split_first() else {
            return;
        };

        if command_class_id == command_class::CONTROLLER_REPLICATION {
            debug!(node_id, "Acknowledging controller replication");
            let msg = Message::new(
                "Replication Command Complete",
                NODE_BROADCAST,
                MessageType::Request,
                Function::ReplicationCommandComplete,
            )
            .without_reply();
            self.queues.push(MsgQueue::Controller, QueueItem::message(msg));
            return;
        }

        let data = data.to_vec();
        let handled = self.with_node(node_id, |node, env, out| {
            node.application_command(env, out, command_class_id, &data, 1, false)
        });
        if handled.is_none() {
            debug!(node_id, "Command from unknown node");
        }
    }

    fn on_application_update(&mut self, payload: &[u8]) {
        let &[state, node_id, ref rest @ ..] = payload else {
            return;
        };
        match state {
            update_state::NODE_INFO_RECEIVED => {
                // [len, basic, generic, specific, classes...]
                let end = rest.first().map_or(0, |&len| (len as usize + 1).min(rest.len()));
                let classes = rest.get(4..end).unwrap_or_default().to_vec();
                debug!(node_id, classes = %hex::encode(&classes), "Node info received");
                self.with_node(node_id, |node, env, out| node.update_node_info(env, out, &classes));
                if let Some(txn) = self.current.as_mut().filter(|t| t.node_id == node_id) {
                    if txn.expected_reply == Some(Function::ApplicationUpdate) {
                        txn.expected_reply = None;
                    }
                }
            }
            update_state::NODE_INFO_REQ_FAILED => {
                // Carries no node id; the request in flight is the one that failed
                if let Some(txn) = self
                    .current
                    .take_if(|t| t.expected_reply == Some(Function::ApplicationUpdate))
                {
                    warn!(node_id = txn.node_id, "Node info request failed");
                    self.node_info_failed(txn.node_id);
                }
            }
            update_state::DELETE_DONE => {
                info!(node_id, "Node removed from the network");
                self.remove_node(node_id);
                self.check_all_queried();
            }
            update_state::NEW_ID_ASSIGNED => {
                info!(node_id, "Node joined the network");
                self.remove_node(node_id);
                self.add_node(node_id);
                self.all_queried = false;
                self.with_node(node_id, |node, env, out| node.advance_queries(env, out));
            }
            _ => debug!(state, node_id, "Application update"),
        }
    }

    /// Forget a node together with its values and pending traffic
    fn remove_node(&mut self, node_id: u8) {
        let Some(node) = self.nodes.remove(&node_id) else {
            return;
        };
        let dropped = self.queues.drain_node(node_id).len();
        self.awaiting_nonce.remove(&node_id);
        if let Some(txn) = self.current.take_if(|t| t.node_id == node_id) {
            debug!(node_id, "Abandoned {}", txn.msg.log_text());
        }
        debug!(node_id, dropped, parked = node.parked(), "Dropped node traffic");
        if let Some(saved) = self.snapshot.as_mut() {
            saved.nodes.retain(|n| n.node_id != node_id);
        }

        let ids: Vec<ValueId> = node.values().iter().map(|v| v.id()).collect();
        for id in ids {
            self.notify(Notification::ValueRemoved(id));
        }
        self.notify(Notification::NodeRemoved {
            home_id: self.home_id,
            node_id,
        });
        self.outputs.save = self.snapshot();
    }

    fn node_info_failed(&mut self, node_id: u8) {
        let stage = QueryStage::NodeInfo;
        if !self.nodes.get(&node_id).is_some_and(|n| n.query_stage() == stage) {
            return;
        }
        self.queues.remove_stage_markers(node_id);
        let outcome = self.with_node(node_id, |node, env, out| node.query_stage_retry(env, out, stage));
        debug!(node_id, ?outcome, "Node info retry");
    }

    /// Complete a transaction waiting on a report the last frame delivered
    fn match_reports(&mut self) {
        let handled = std::mem::take(&mut self.handled);
        if let Some(txn) = self.current.as_mut() {
            if txn.expected_reply == Some(Function::ApplicationCommandHandler)
                && handled
                    .iter()
                    .any(|&(node, cc)| node == txn.node_id && cc == txn.expected_cc)
            {
                txn.expected_reply = None;
            }
        }
    }

    // Security

    fn security_effect(&mut self, node_id: u8, effect: Effect) {
        match effect {
            Effect::NonceRequested => self.send_nonce(node_id),
            Effect::NonceReceived(nonce) => {
                trace!(node_id, "Nonce received");
                self.nonces.store_received(node_id, nonce);
                if let Some(parked) = self.awaiting_nonce.remove(&node_id) {
                    for item in parked.into_iter().rev() {
                        self.queues.push_front(MsgQueue::Security, item);
                    }
                }
            }
            Effect::SecureMessage {
                data,
                nonce_requested,
            } => {
                self.open_secure(node_id, &data);
                if nonce_requested {
                    self.send_nonce(node_id);
                }
            }
            other => debug!(node_id, ?other, "Ignored effect"),
        }
    }

    /// Answer a nonce request right away; the node is waiting for it
    fn send_nonce(&mut self, node_id: u8) {
        let nonce = self.nonces.issue(&mut self.rng);
        let mut command = Vec::with_capacity(1 + nonce.len());
        command.push(security::NONCE_REPORT);
        command.extend_from_slice(&nonce);

        let mut msg = Message::send_data(
            "SecurityCmd_NonceReport",
            node_id,
            command_class::SECURITY,
            &command,
        )
        .without_reply();
        match msg.finalize(&self.callbacks) {
            Ok(()) => {
                trace!(node_id, nonce_id = nonce[0], "Sending nonce");
                self.outputs.writes.push(msg.to_bytes());
            }
            Err(e) => warn!(node_id, "Nonce report not sent: {}", e),
        }
    }

    fn open_secure(&mut self, node_id: u8, data: &[u8]) {
        let Some(keys) = self.keys.as_ref() else {
            warn!(node_id, "Secure frame received without a network key");
            return;
        };
        match SecureFrame::open(data, keys, node_id, self.controller_node_id, &mut self.nonces) {
            Ok(plain) => {
                let Some((&command_class_id, command)) = plain.split_first() else {
                    return;
                };
                let command = command.to_vec();
                self.with_node(node_id, |node, env, out| {
                    node.application_command(env, out, command_class_id, &command, 1, true)
                });
            }
            Err(e) => {
                warn!(node_id, "Secure frame rejected: {}", e);
                self.secure_send_failed(node_id);
            }
        }
    }
}

impl std::fmt::Debug for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverState")
            .field("home_id", &format_args!("0x{:08X}", self.home_id))
            .field("controller_node_id", &self.controller_node_id)
            .field("nodes", &self.nodes.len())
            .field("ready", &self.ready)
            .field("busy", &self.current.is_some())
            .finish_non_exhaustive()
    }
}
