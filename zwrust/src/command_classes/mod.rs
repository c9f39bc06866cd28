//! Command class handlers
//!
//! One [`CommandClassHandler`] per class a node supports. Handlers decode
//! incoming application commands into value updates, build the requests that
//! read values, and translate value sets into messages. They never touch the
//! driver directly: everything they want done goes through the
//! [`CcContext`] into an [`Outbox`].

pub mod association;
pub mod basic;
pub mod battery;
pub mod central_scene;
pub mod configuration;
pub mod manufacturer_specific;
pub mod multi_instance;
pub mod no_operation;
pub mod node_naming;
pub mod registry;
pub mod security;
pub mod sensor_binary;
pub mod sensor_multilevel;
pub mod switch_binary;
pub mod switch_multilevel;
pub mod version;
pub mod wake_up;

pub use registry::CommandClassRegistry;

use bitflags::bitflags;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

use zwrust_core::{Encapsulation, Message};
use zwrust_types::{AssociationGroup, ManufacturerInfo, ValueGenre, ValueId, ValueType};

use crate::driver::queue::{MsgQueue, QueueItem};
use crate::error::Result;
use crate::notification::Notification;
use crate::product::Collaborators;
use crate::value::{RefreshOutcome, Value, ValueData, ValueStore};

bitflags! {
    /// Categories of data a [`CommandClassHandler::request_state`] call asks for
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestFlags: u8 {
        /// Never changes (capabilities, supported ranges)
        const STATIC = 0x01;
        /// Changes rarely (names, configuration)
        const SESSION = 0x02;
        /// Changes often (levels, readings)
        const DYNAMIC = 0x04;
    }
}

/// What the node knows about one of its classes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcInfo {
    pub version: u8,
    pub instances: u8,
    /// Instance to multi channel endpoint, where they differ
    pub endpoints: BTreeMap<u8, u8>,
    /// Class must be sent and received encapsulated by Security
    pub secure: bool,
    /// Listed after the mark in the node information frame
    pub after_mark: bool,
}

impl Default for CcInfo {
    fn default() -> Self {
        Self {
            version: 1,
            instances: 1,
            endpoints: BTreeMap::new(),
            secure: false,
            after_mark: false,
        }
    }
}

/// Node-level change requested by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Manufacturer(ManufacturerInfo),
    /// Version of a class; 0 means the class is not supported after all
    ClassVersion { command_class_id: u8, version: u8 },
    /// Multi Instance v1 report
    Instances { command_class_id: u8, count: u8 },
    /// Multi Channel capability report
    Endpoint { endpoint: u8, classes: Vec<u8> },
    /// Command unwrapped from Multi Instance / Multi Channel
    Encapsulated {
        instance: u8,
        endpoint: Option<u8>,
        data: Vec<u8>,
    },
    Name(String),
    Location(String),
    Awake,
    AssociationGroups(u8),
    Association(AssociationGroup),
    /// Classes the node only accepts under Security
    SecureClasses(Vec<u8>),
    /// Node asked for a nonce
    NonceRequested,
    /// Node handed us a nonce
    NonceReceived([u8; 8]),
    /// Encrypted command to authenticate and decrypt
    SecureMessage { data: Vec<u8>, nonce_requested: bool },
}

impl Effect {
    /// Effects the driver resolves (keys and nonces live there)
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Self::NonceRequested | Self::NonceReceived(_) | Self::SecureMessage { .. }
        )
    }
}

/// Output of handler and node calls, drained by the driver
#[derive(Debug, Default)]
pub struct Outbox {
    pub messages: Vec<(MsgQueue, QueueItem)>,
    pub notifications: Vec<Notification>,
    pub effects: Vec<(u8, Effect)>,
    /// `(node, class)` of every command a handler accepted
    pub handled: Vec<(u8, u8)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, queue: MsgQueue, msg: Message) {
        self.messages.push((queue, QueueItem::message(msg)));
    }

    pub fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.notifications.is_empty()
            && self.effects.is_empty()
            && self.handled.is_empty()
    }
}

/// Everything a handler may see or touch during one call
pub struct CcContext<'a> {
    pub home_id: u32,
    pub node_id: u8,
    pub controller_node_id: u8,
    pub command_class_id: u8,
    pub info: &'a CcInfo,
    /// Node speaks Multi Channel (version 2+) rather than Multi Instance
    pub multi_channel: bool,
    pub values: &'a mut ValueStore,
    pub collaborators: &'a Collaborators,
    pub out: &'a mut Outbox,
}

impl CcContext<'_> {
    /// Id of a value of this class
    pub fn value_id(
        &self,
        genre: ValueGenre,
        instance: u8,
        index: u8,
        value_type: ValueType,
    ) -> Result<ValueId> {
        Ok(ValueId::new(
            self.home_id,
            self.node_id,
            genre,
            self.command_class_id,
            instance,
            index,
            value_type,
        )?)
    }

    /// Register a value, announcing it when new
    pub fn add_value(&mut self, value: Value) -> Arc<Value> {
        let (value, added) = self.values.add(value);
        if added {
            trace!(value = %value.id(), "Value added");
            self.out.notify(Notification::ValueAdded(Arc::clone(&value)));
        }
        value
    }

    /// Value of this class by instance and index
    pub fn value(&self, instance: u8, index: u8) -> Option<Arc<Value>> {
        self.values.find(self.command_class_id, instance, index)
    }

    /// Translated label
    pub fn label(&self, id: &str, default: &str) -> String {
        self.collaborators.label(id, default)
    }

    /// Feed a reading into a value and queue the notification
    ///
    /// Returns `None` when the value does not exist or has another type.
    pub fn refresh(&mut self, instance: u8, index: u8, data: ValueData) -> Option<RefreshOutcome> {
        let value = self.value(instance, index)?;
        match value.on_value_refreshed(data) {
            Ok(outcome) => {
                match outcome {
                    RefreshOutcome::Changed => self.out.notify(Notification::ValueChanged(value)),
                    RefreshOutcome::Refreshed => {
                        self.out.notify(Notification::ValueRefreshed(value))
                    }
                    RefreshOutcome::Verifying => {}
                }
                Some(outcome)
            }
            Err(e) => {
                warn!(node_id = self.node_id, "Dropped reading: {}", e);
                None
            }
        }
    }

    /// Wrapping needed to address `instance` of this class
    pub fn encapsulation(&self, instance: u8) -> Encapsulation {
        let endpoint = self.info.endpoints.get(&instance).copied();
        match (endpoint, self.multi_channel) {
            (Some(endpoint), true) => Encapsulation::MultiChannel { endpoint },
            (None, true) if instance > 1 => Encapsulation::MultiChannel { endpoint: instance },
            (_, false) if instance > 1 => Encapsulation::MultiInstance { instance },
            _ => Encapsulation::None,
        }
    }

    /// SendData carrying `command` of this class to `instance`
    pub fn command(&self, log_text: &str, instance: u8, command: &[u8]) -> Result<Message> {
        let mut msg = Message::send_data(log_text, self.node_id, self.command_class_id, command);
        msg.set_encapsulation(self.encapsulation(instance))?;
        msg.set_secure(self.info.secure);
        Ok(msg)
    }

    /// Like [`command`](Self::command), completing on the class's report
    pub fn request(&self, log_text: &str, instance: u8, command: &[u8]) -> Result<Message> {
        Ok(self
            .command(log_text, instance, command)?
            .expect_report(self.command_class_id))
    }

    /// Build and queue a request; false when it could not be built
    pub fn send_request(&mut self, log_text: &str, instance: u8, command: &[u8], queue: MsgQueue) -> bool {
        match self.request(log_text, instance, command) {
            Ok(msg) => {
                self.out.send(queue, msg);
                true
            }
            Err(e) => {
                warn!(node_id = self.node_id, "{} not queued: {}", log_text, e);
                false
            }
        }
    }

    /// Queue a message that sets `value`, confirmed once transmitted
    pub fn send_set(&mut self, msg: Message, value: ValueId) {
        self.out.messages.push((
            MsgQueue::Send,
            QueueItem::Send {
                msg: Box::new(msg),
                set_value: Some(value),
            },
        ));
    }

    pub fn notify(&mut self, notification: Notification) {
        self.out.notify(notification);
    }

    pub fn effect(&mut self, effect: Effect) {
        self.out.effects.push((self.node_id, effect));
    }
}

/// Decoder and encoder of one command class on one node
pub trait CommandClassHandler: Send + Sync + fmt::Debug {
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Highest version implemented here
    fn max_version(&self) -> u8 {
        1
    }

    /// Register the values this class owns for `instance`
    fn create_vars(&self, _ctx: &mut CcContext<'_>, _instance: u8) {}

    /// Queue requests for one category of data; true if anything was queued
    fn request_state(
        &self,
        _ctx: &mut CcContext<'_>,
        _flags: RequestFlags,
        _instance: u8,
        _queue: MsgQueue,
    ) -> bool {
        false
    }

    /// Queue a request for the value at `index`; true if anything was queued
    fn request_value(&self, _ctx: &mut CcContext<'_>, _index: u8, _instance: u8, _queue: MsgQueue) -> bool {
        false
    }

    /// Decode an application command (`data` starts at the command byte)
    ///
    /// Returns false when the command is not understood.
    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], instance: u8) -> bool;

    /// Queue the message that writes `data` to `value`
    ///
    /// Returns false when the value is not settable through this class.
    fn set_value(&self, _ctx: &mut CcContext<'_>, _value: &Value, _data: &ValueData) -> Result<bool> {
        Ok(false)
    }

    /// Refresh a value and read it again while its change is unconfirmed
    fn update_value(&self, ctx: &mut CcContext<'_>, instance: u8, index: u8, data: ValueData) {
        if ctx.refresh(instance, index, data) == Some(RefreshOutcome::Verifying) {
            self.request_value(ctx, index, instance, MsgQueue::Send);
        }
    }
}

/// Test scaffolding shared by handler tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub const HOME_ID: u32 = 0xC0FF_EE00;
    pub const NODE_ID: u8 = 7;
    pub const CONTROLLER_ID: u8 = 1;

    /// Node-less harness around one handler
    pub struct Harness {
        pub info: CcInfo,
        pub multi_channel: bool,
        pub values: ValueStore,
        pub collaborators: Collaborators,
        pub out: Outbox,
    }

    impl Harness {
        pub fn new() -> Self {
            Self {
                info: CcInfo::default(),
                multi_channel: false,
                values: ValueStore::new(),
                collaborators: Collaborators::default(),
                out: Outbox::new(),
            }
        }

        pub fn ctx(&mut self, command_class_id: u8) -> CcContext<'_> {
            CcContext {
                home_id: HOME_ID,
                node_id: NODE_ID,
                controller_node_id: CONTROLLER_ID,
                command_class_id,
                info: &self.info,
                multi_channel: self.multi_channel,
                values: &mut self.values,
                collaborators: &self.collaborators,
                out: &mut self.out,
            }
        }

        /// Command class bytes of the queued messages
        pub fn sent_commands(&self) -> Vec<Vec<u8>> {
            self.out
                .messages
                .iter()
                .filter_map(|(_, item)| match item {
                    QueueItem::Send { msg, .. } => msg.command_payload().map(<[u8]>::to_vec),
                    QueueItem::StageComplete { .. } => None,
                })
                .collect()
        }

        pub fn changed(&self) -> Vec<ValueData> {
            self.out
                .notifications
                .iter()
                .filter_map(|n| match n {
                    Notification::ValueChanged(v) => Some(v.data()),
                    _ => None,
                })
                .collect()
        }

        pub fn effects(&self) -> Vec<Effect> {
            self.out.effects.iter().map(|(_, e)| e.clone()).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use zwrust_core::constants::command_class;

    #[test]
    fn test_encapsulation_choice() {
        let mut harness = Harness::new();
        assert_eq!(harness.ctx(0x25).encapsulation(1), Encapsulation::None);
        assert_eq!(
            harness.ctx(0x25).encapsulation(2),
            Encapsulation::MultiInstance { instance: 2 }
        );

        harness.multi_channel = true;
        harness.info.endpoints.insert(2, 5);
        assert_eq!(
            harness.ctx(0x25).encapsulation(2),
            Encapsulation::MultiChannel { endpoint: 5 }
        );
        assert_eq!(
            harness.ctx(0x25).encapsulation(3),
            Encapsulation::MultiChannel { endpoint: 3 }
        );
    }

    #[test]
    fn test_secure_class_marks_message() {
        let mut harness = Harness::new();
        harness.info.secure = true;

        let msg = harness
            .ctx(command_class::SWITCH_BINARY)
            .request("SwitchBinaryCmd_Get", 1, &[0x02])
            .unwrap();

        assert!(msg.is_secure());
        assert_eq!(msg.expected_command_class_id(), command_class::SWITCH_BINARY);
    }

    #[test]
    fn test_refresh_unknown_value() {
        let mut harness = Harness::new();
        assert_eq!(harness.ctx(0x25).refresh(1, 0, ValueData::Bool(true)), None);
        assert!(harness.out.notifications.is_empty());
    }
}
