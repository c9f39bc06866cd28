//! Nodes of the network
//!
//! A [`Node`] owns the command class handlers, values and association
//! groups of one device plus its discovery progress. It is driven by the
//! driver through plain method calls; everything it wants sent or announced
//! lands in an [`Outbox`].

pub mod discovery;

pub use discovery::{Discovery, RetryOutcome};

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use zwrust_core::constants::{command_class, COMMAND_CLASS_MARK, MAX_NODES, NODE_BITMAP_LEN};
use zwrust_types::{
    AssociationGroup, CommandClassSnapshot, ManufacturerInfo, NodeProtocolInfo, NodeSnapshot,
    QueryStage, ValueId,
};

use crate::command_classes::{
    association, configuration, node_naming, no_operation::NoOperation, CcContext, CcInfo,
    CommandClassHandler, CommandClassRegistry, Effect, Outbox,
};
use crate::driver::queue::{MsgQueue, QueueItem};
use crate::error::{Error, Result};
use crate::notification::Notification;
use crate::product::Collaborators;
use crate::value::{Affects, Value, ValueData, ValueStore};

/// Driver-wide context a node needs for most operations
pub struct NodeEnv<'a> {
    pub controller_node_id: u8,
    pub registry: &'a CommandClassRegistry,
    pub collaborators: &'a Collaborators,
    /// A network key is configured
    pub security_enabled: bool,
    /// Node info requests before discovery moves on without it
    pub max_attempts: u8,
}

/// Handler of one class plus what the node knows about it
#[derive(Debug)]
pub struct CommandClassEntry {
    pub handler: Box<dyn CommandClassHandler>,
    pub info: CcInfo,
}

/// One device of the network
#[derive(Debug)]
pub struct Node {
    home_id: u32,
    node_id: u8,
    is_controller: bool,
    protocol_info: Option<NodeProtocolInfo>,
    neighbors: Vec<u8>,
    classes: BTreeMap<u8, CommandClassEntry>,
    values: ValueStore,
    group_count: u8,
    groups: BTreeMap<u8, AssociationGroup>,
    manufacturer: Option<ManufacturerInfo>,
    name: String,
    location: String,
    discovery: Discovery,
    node_info_received: bool,
    awake: bool,
    /// Traffic held back until the node wakes up
    wake_up_queue: VecDeque<QueueItem>,
    /// Send it back to sleep once its traffic drained
    no_more_info_pending: bool,
}

impl Node {
    pub fn new(home_id: u32, node_id: u8) -> Self {
        Self {
            home_id,
            node_id,
            is_controller: false,
            protocol_info: None,
            neighbors: Vec::new(),
            classes: BTreeMap::new(),
            values: ValueStore::new(),
            group_count: 0,
            groups: BTreeMap::new(),
            manufacturer: None,
            name: String::new(),
            location: String::new(),
            discovery: Discovery::new(),
            node_info_received: false,
            awake: true,
            wake_up_queue: VecDeque::new(),
            no_more_info_pending: false,
        }
    }

    /// Mark this node as the controller itself
    pub fn with_controller(mut self, is_controller: bool) -> Self {
        self.is_controller = is_controller;
        self
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn home_id(&self) -> u32 {
        self.home_id
    }

    pub fn is_controller(&self) -> bool {
        self.is_controller
    }

    pub fn protocol_info(&self) -> Option<&NodeProtocolInfo> {
        self.protocol_info.as_ref()
    }

    /// Nodes that neither listen nor wake on beam
    pub fn is_sleeping(&self) -> bool {
        !self.is_controller
            && self
                .protocol_info
                .as_ref()
                .is_some_and(|p| !p.is_listening() && !p.is_frequent_listening())
    }

    pub fn is_awake(&self) -> bool {
        self.awake
    }

    pub fn neighbors(&self) -> &[u8] {
        &self.neighbors
    }

    pub fn set_neighbors(&mut self, bitmap: &[u8]) {
        self.neighbors = node_ids_from_bitmap(bitmap);
        debug!(node_id = self.node_id, neighbors = ?self.neighbors, "Neighbors updated");
    }

    pub fn manufacturer(&self) -> Option<&ManufacturerInfo> {
        self.manufacturer.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn groups(&self) -> impl Iterator<Item = &AssociationGroup> {
        self.groups.values()
    }

    pub fn group(&self, index: u8) -> Option<&AssociationGroup> {
        self.groups.get(&index)
    }

    pub fn query_stage(&self) -> QueryStage {
        self.discovery.stage()
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn values(&self) -> &ValueStore {
        &self.values
    }

    pub fn value(&self, id: &ValueId) -> Option<Arc<Value>> {
        self.values.get(id)
    }

    /// Ids of every class, supported and controlled
    pub fn command_class_ids(&self) -> Vec<u8> {
        self.classes.keys().copied().collect()
    }

    pub fn has_command_class(&self, command_class_id: u8) -> bool {
        self.classes.contains_key(&command_class_id)
    }

    pub fn class_info(&self, command_class_id: u8) -> Option<&CcInfo> {
        self.classes.get(&command_class_id).map(|e| &e.info)
    }

    /// Node speaks Multi Channel rather than Multi Instance
    fn multi_channel(&self) -> bool {
        self.classes
            .get(&command_class::MULTI_INSTANCE)
            .is_some_and(|e| e.info.version >= 2)
    }

    /// Run `f` with the handler of a class and a context around it
    fn with_handler<R>(
        &mut self,
        env: &NodeEnv<'_>,
        out: &mut Outbox,
        command_class_id: u8,
        f: impl FnOnce(&mut dyn CommandClassHandler, &mut CcContext<'_>) -> R,
    ) -> Option<R> {
        let multi_channel = self.multi_channel();
        let entry = self.classes.get_mut(&command_class_id)?;
        let mut ctx = CcContext {
            home_id: self.home_id,
            node_id: self.node_id,
            controller_node_id: env.controller_node_id,
            command_class_id,
            info: &entry.info,
            multi_channel,
            values: &mut self.values,
            collaborators: env.collaborators,
            out,
        };
        Some(f(entry.handler.as_mut(), &mut ctx))
    }

    /// Store protocol info
    ///
    /// Sleeping nodes always get a Wake Up handler, even before their
    /// node information arrives.
    pub fn set_protocol_info(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, info: NodeProtocolInfo) {
        info!(node_id = self.node_id, "Protocol info: {}", info);
        self.protocol_info = Some(info);
        if self.is_sleeping() {
            self.add_command_class(env, out, command_class::WAKE_UP, false);
        }
        out.notify(Notification::NodeProtocolInfo {
            home_id: self.home_id,
            node_id: self.node_id,
        });
    }

    /// Load the classes of a node information frame
    ///
    /// Classes after the mark are controlled rather than supported.
    pub fn update_node_info(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, classes: &[u8]) {
        let mut after_mark = false;
        for &class in classes {
            if class == COMMAND_CLASS_MARK {
                after_mark = true;
                continue;
            }
            if !self.add_command_class(env, out, class, after_mark) && !self.classes.contains_key(&class) {
                debug!(node_id = self.node_id, "Command class 0x{:02X} not supported", class);
            }
        }
        self.node_info_received = true;
    }

    /// Create the handler of a class unless the node has it already
    ///
    /// Returns true when a handler was added.
    pub fn add_command_class(
        &mut self,
        env: &NodeEnv<'_>,
        out: &mut Outbox,
        command_class_id: u8,
        after_mark: bool,
    ) -> bool {
        if self.classes.contains_key(&command_class_id) {
            return false;
        }
        let Some(handler) = env.registry.create(command_class_id) else {
            return false;
        };
        debug!(node_id = self.node_id, "Adding {}", handler.name());
        self.classes.insert(
            command_class_id,
            CommandClassEntry {
                handler,
                info: CcInfo {
                    after_mark,
                    ..CcInfo::default()
                },
            },
        );
        if !after_mark {
            self.create_vars(env, out, command_class_id);
        }
        true
    }

    /// Drop a class with its values
    pub fn remove_command_class(&mut self, out: &mut Outbox, command_class_id: u8) {
        if self.classes.remove(&command_class_id).is_none() {
            return;
        }
        debug!(node_id = self.node_id, "Removing command class 0x{:02X}", command_class_id);
        for id in self.values.remove_command_class(command_class_id) {
            out.notify(Notification::ValueRemoved(id));
        }
    }

    fn create_vars(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, command_class_id: u8) {
        let instances = self
            .classes
            .get(&command_class_id)
            .map_or(0, |e| e.info.instances);
        for instance in 1..=instances {
            self.with_handler(env, out, command_class_id, |h, ctx| h.create_vars(ctx, instance));
        }
    }

    /// Handle an application command addressed to this node
    ///
    /// Returns true when a handler accepted it. Security effects are left in
    /// `out.effects` for the driver.
    pub fn application_command(
        &mut self,
        env: &NodeEnv<'_>,
        out: &mut Outbox,
        command_class_id: u8,
        data: &[u8],
        instance: u8,
        secure: bool,
    ) -> bool {
        let handled = self.dispatch(env, out, command_class_id, data, instance, secure);
        self.apply_effects(env, out, secure);
        handled
    }

    fn dispatch(
        &mut self,
        env: &NodeEnv<'_>,
        out: &mut Outbox,
        command_class_id: u8,
        data: &[u8],
        instance: u8,
        secure: bool,
    ) -> bool {
        if !self.classes.contains_key(&command_class_id) {
            let load_on_demand = command_class_id == command_class::MULTI_INSTANCE
                && self.discovery.stage().is_complete();
            if !(load_on_demand && self.add_command_class(env, out, command_class_id, false)) {
                debug!(
                    node_id = self.node_id,
                    "Dropped command for unsupported class 0x{:02X}", command_class_id
                );
                return false;
            }
            info!(node_id = self.node_id, "Multi instance handler loaded on demand");
        }

        if !secure && self.classes.get(&command_class_id).is_some_and(|e| e.info.secure) {
            warn!(
                node_id = self.node_id,
                "Dropped clear text command for secure class 0x{:02X}", command_class_id
            );
            return false;
        }

        let handled = self
            .with_handler(env, out, command_class_id, |h, ctx| h.handle_msg(ctx, data, instance))
            .unwrap_or(false);
        if handled {
            out.handled.push((self.node_id, command_class_id));
        }
        handled
    }

    fn apply_effects(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, secure: bool) {
        let mut kept = Vec::new();
        let mut pending = std::mem::take(&mut out.effects);
        while !pending.is_empty() {
            for (node_id, effect) in pending {
                if effect.is_security() {
                    kept.push((node_id, effect));
                } else {
                    self.apply_effect(env, out, effect, secure);
                }
            }
            pending = std::mem::take(&mut out.effects);
        }
        out.effects = kept;
    }

    fn apply_effect(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, effect: Effect, secure: bool) {
        match effect {
            Effect::Manufacturer(manufacturer) => self.manufacturer = Some(manufacturer),
            Effect::ClassVersion {
                command_class_id,
                version,
            } => {
                if version == 0 {
                    self.remove_command_class(out, command_class_id);
                } else if let Some(entry) = self.classes.get_mut(&command_class_id) {
                    entry.info.version = version.min(entry.handler.max_version());
                    self.create_vars(env, out, command_class_id);
                }
            }
            Effect::Instances {
                command_class_id,
                count,
            } => {
                if let Some(entry) = self.classes.get_mut(&command_class_id) {
                    entry.info.instances = count.max(1);
                    self.create_vars(env, out, command_class_id);
                }
            }
            Effect::Endpoint { endpoint, classes } => {
                for class in classes.into_iter().take_while(|&c| c != COMMAND_CLASS_MARK) {
                    self.add_endpoint_class(env, out, endpoint, class);
                }
            }
            Effect::Encapsulated {
                instance,
                endpoint,
                data,
            } => {
                let Some((&class, command)) = data.split_first() else {
                    return;
                };
                let instance = endpoint
                    .and_then(|ep| self.instance_of_endpoint(class, ep))
                    .unwrap_or(instance);
                self.dispatch(env, out, class, command, instance, secure);
            }
            Effect::Name(name) => self.name = name,
            Effect::Location(location) => self.location = location,
            Effect::Awake => self.wake(out),
            Effect::AssociationGroups(count) => {
                self.group_count = count;
                for index in 1..=count {
                    self.groups
                        .entry(index)
                        .or_insert_with(|| AssociationGroup::new(index, 0));
                }
            }
            Effect::Association(group) => {
                let label = self.groups.get(&group.index).map(|g| g.label.clone());
                let mut group = group;
                if let Some(label) = label {
                    group.label = label;
                }
                self.group_count = self.group_count.max(group.index);
                self.groups.insert(group.index, group);
            }
            Effect::SecureClasses(classes) => {
                for class in classes {
                    if class == command_class::SECURITY {
                        continue;
                    }
                    self.add_command_class(env, out, class, false);
                    if let Some(entry) = self.classes.get_mut(&class) {
                        entry.info.secure = true;
                    }
                }
            }
            Effect::NonceRequested | Effect::NonceReceived(_) | Effect::SecureMessage { .. } => {
                out.effects.push((self.node_id, effect));
            }
        }
    }

    /// Map a class of a multi channel endpoint onto an instance
    fn add_endpoint_class(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, endpoint: u8, class: u8) {
        let instance = if self.add_command_class(env, out, class, false) {
            1
        } else if let Some(entry) = self.classes.get_mut(&class) {
            if entry.info.endpoints.values().any(|&ep| ep == endpoint) {
                return;
            }
            entry.info.instances = entry.info.instances.saturating_add(1);
            entry.info.instances
        } else {
            return;
        };

        if let Some(entry) = self.classes.get_mut(&class) {
            entry.info.endpoints.insert(instance, endpoint);
        }
        debug!(node_id = self.node_id, class, endpoint, instance, "Endpoint class mapped");
        self.with_handler(env, out, class, |h, ctx| h.create_vars(ctx, instance));
    }

    fn instance_of_endpoint(&self, class: u8, endpoint: u8) -> Option<u8> {
        self.classes
            .get(&class)?
            .info
            .endpoints
            .iter()
            .find(|&(_, &ep)| ep == endpoint)
            .map(|(&instance, _)| instance)
    }

    /// Node reported it is awake: release its parked traffic
    fn wake(&mut self, out: &mut Outbox) {
        info!(
            node_id = self.node_id,
            parked = self.wake_up_queue.len(),
            "Node is awake"
        );
        self.awake = true;
        for item in self.wake_up_queue.drain(..) {
            out.messages.push((MsgQueue::WakeUp, item));
        }
        if self.is_sleeping() {
            self.no_more_info_pending = true;
        }
    }

    /// Node went (back) to sleep
    pub fn set_asleep(&mut self) {
        if self.is_sleeping() {
            self.awake = false;
        }
    }

    /// Hold an entry until the node wakes up
    pub fn park(&mut self, item: QueueItem) {
        self.wake_up_queue.push_back(item);
    }

    pub fn parked(&self) -> usize {
        self.wake_up_queue.len()
    }

    /// Whether a No More Information is owed; clears the flag
    pub fn take_no_more_info(&mut self) -> bool {
        std::mem::take(&mut self.no_more_info_pending)
    }

    /// Queue the write of `data` to a value
    pub fn set_value(
        &mut self,
        env: &NodeEnv<'_>,
        out: &mut Outbox,
        id: &ValueId,
        data: ValueData,
    ) -> Result<()> {
        let value = self.values.get(id).ok_or(Error::ValueNotFound(*id))?;
        value.check_set(&data)?;

        let accepted = self
            .with_handler(env, out, id.command_class_id, |h, ctx| h.set_value(ctx, &value, &data))
            .ok_or(Error::UnsupportedCommandClass(id.command_class_id))??;
        if !accepted {
            return Err(Error::UnsupportedCommandClass(id.command_class_id));
        }
        debug!(node_id = self.node_id, value = %id, %data, "Set queued");
        Ok(())
    }

    /// Queue a read of one value
    pub fn request_value(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, id: &ValueId, queue: MsgQueue) -> bool {
        self.with_handler(env, out, id.command_class_id, |h, ctx| {
            h.request_value(ctx, id.index, id.instance, queue)
        })
        .unwrap_or(false)
    }

    /// Read back what a completed set touched
    pub fn confirm_set(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, id: &ValueId) {
        let Some(value) = self.values.get(id) else {
            return;
        };
        if !value.is_write_only() {
            self.request_value(env, out, id, MsgQueue::Send);
            return;
        }
        match value.affects() {
            Affects::Nothing => {}
            Affects::Indices(indices) => {
                for &index in indices {
                    self.with_handler(env, out, id.command_class_id, |h, ctx| {
                        h.request_value(ctx, index, id.instance, MsgQueue::Send)
                    });
                }
            }
            Affects::All => {
                self.with_handler(env, out, command_class::CONFIGURATION, |_, ctx| {
                    configuration::request_all(ctx, MsgQueue::Send)
                });
            }
        }
    }

    /// Values due in a poll round
    pub fn poll_due(&self, round: u32) -> Vec<ValueId> {
        self.values
            .iter()
            .filter(|v| v.poll_intensity() > 0 && round % v.poll_intensity() as u32 == 0)
            .map(|v| v.id())
            .collect()
    }

    /// Rename the node
    pub fn set_name(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, name: &str) -> Result<()> {
        self.name = name.to_string();
        self.with_handler(env, out, command_class::NODE_NAMING, |_, ctx| node_naming::set_name(ctx, name))
            .unwrap_or(Ok(()))
    }

    pub fn set_location(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, location: &str) -> Result<()> {
        self.location = location.to_string();
        self.with_handler(env, out, command_class::NODE_NAMING, |_, ctx| {
            node_naming::set_location(ctx, location)
        })
        .unwrap_or(Ok(()))
    }

    pub fn add_association(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, group: u8, target: u8) -> Result<()> {
        if self.groups.get(&group).is_some_and(|g| !g.has_room()) {
            return Err(Error::GroupFull {
                node_id: self.node_id,
                group,
            });
        }
        self.with_handler(env, out, command_class::ASSOCIATION, |_, ctx| {
            association::add(ctx, group, target)
        })
        .ok_or(Error::UnsupportedCommandClass(command_class::ASSOCIATION))?
    }

    pub fn remove_association(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, group: u8, target: u8) -> Result<()> {
        self.with_handler(env, out, command_class::ASSOCIATION, |_, ctx| {
            association::remove(ctx, group, target)
        })
        .ok_or(Error::UnsupportedCommandClass(command_class::ASSOCIATION))?
    }

    /// Check the node answers at all
    pub fn ping(&mut self, env: &NodeEnv<'_>, out: &mut Outbox) -> Result<()> {
        if !self.classes.contains_key(&command_class::NO_OPERATION) {
            self.add_command_class(env, out, command_class::NO_OPERATION, false);
        }
        let msg = self
            .with_handler(env, out, command_class::NO_OPERATION, |_, ctx| NoOperation::ping(ctx))
            .ok_or(Error::UnsupportedCommandClass(command_class::NO_OPERATION))??;
        out.send(MsgQueue::Send, msg);
        Ok(())
    }

    /// Persisted form
    pub fn to_snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node_id: self.node_id,
            query_stage: self.discovery.stage(),
            protocol_info: self.protocol_info.clone(),
            command_classes: self
                .classes
                .iter()
                .filter(|(_, e)| !e.info.after_mark)
                .map(|(&id, e)| {
                    (
                        id,
                        CommandClassSnapshot {
                            version: e.info.version,
                            instances: e.info.instances,
                            secure: e.info.secure,
                        },
                    )
                })
                .collect(),
            manufacturer: self.manufacturer.clone(),
            name: self.name.clone(),
            location: self.location.clone(),
            associations: self.groups.values().cloned().collect(),
        }
    }

    /// Restore what an earlier run learned; discovery resumes where the
    /// snapshot allows
    pub fn restore(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, snapshot: &NodeSnapshot) {
        self.protocol_info = snapshot.protocol_info.clone();
        for (&id, saved) in &snapshot.command_classes {
            self.add_command_class(env, out, id, false);
            if let Some(entry) = self.classes.get_mut(&id) {
                entry.info.version = saved.version.max(1);
                entry.info.instances = saved.instances.max(1);
                entry.info.secure = saved.secure;
            }
            self.create_vars(env, out, id);
        }
        self.node_info_received = !snapshot.command_classes.is_empty();
        self.manufacturer = snapshot.manufacturer.clone();
        self.name = snapshot.name.clone();
        self.location = snapshot.location.clone();
        for group in &snapshot.associations {
            self.groups.insert(group.index, group.clone());
        }
        self.group_count = self.groups.keys().max().copied().unwrap_or(0);
        self.discovery = Discovery::resume(snapshot.resume_stage());
        info!(node_id = self.node_id, stage = %self.discovery.stage(), "Node restored");
    }
}

/// Node ids set in a 29-byte node bitmap
///
/// Bytes past the bitmap and bits above the last node id are ignored.
pub fn node_ids_from_bitmap(bitmap: &[u8]) -> Vec<u8> {
    let bitmap = &bitmap[..bitmap.len().min(NODE_BITMAP_LEN)];
    bitmap
        .iter()
        .enumerate()
        .flat_map(|(byte, &bits)| {
            (0..8usize).filter_map(move |bit| {
                let node_id = byte * 8 + bit + 1;
                (bits & (1 << bit) != 0 && node_id <= MAX_NODES)
                    .then(|| u8::try_from(node_id).ok())
                    .flatten()
            })
        })
        .collect()
}
