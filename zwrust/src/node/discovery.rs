//! Per-node discovery
//!
//! Discovery walks the [`QueryStage`]s in order. A stage that needs answers
//! from the network queues its requests followed by a stage marker and
//! becomes pending; the driver reports the stage complete once the marker
//! reaches the head of the queue. Stages with nothing to ask are skipped.

use tracing::{debug, info, warn};

use zwrust_core::constants::command_class;
use zwrust_core::{Function, Message, MessageType};
use zwrust_types::QueryStage;

use super::{Node, NodeEnv};
use crate::command_classes::{
    association, configuration, manufacturer_specific, multi_instance, security, version, wake_up,
    Outbox, RequestFlags,
};
use crate::driver::queue::{MsgQueue, QueueItem};
use crate::notification::Notification;

/// What [`Discovery::query_stage_retry`] decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Not the current stage
    Ignored,
    /// Stage will be requested again
    Retrying,
    /// Retries exhausted; the caller completes the stage
    GiveUp,
}

/// Stage bookkeeping of one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    stage: QueryStage,
    pending: bool,
    retries: u8,
    configuration_requery: bool,
    complete_notified: bool,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start at `stage`, e.g. from a snapshot
    pub fn resume(stage: QueryStage) -> Self {
        Self {
            stage,
            ..Self::default()
        }
    }

    pub fn stage(&self) -> QueryStage {
        self.stage
    }

    /// Waiting for the current stage's requests
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn set_pending(&mut self) {
        self.pending = true;
    }

    /// Leave `stage` for the next one
    ///
    /// Returns false, changing nothing, unless `stage` is current.
    pub fn query_stage_complete(&mut self, stage: QueryStage) -> bool {
        if stage != self.stage || stage.is_complete() {
            return false;
        }
        self.pending = false;
        self.retries = 0;
        self.stage = stage.next();
        true
    }

    /// Count a failed attempt at `stage`
    ///
    /// `max == 0` retries forever.
    pub fn query_stage_retry(&mut self, stage: QueryStage, max: u8) -> RetryOutcome {
        if stage != self.stage {
            return RetryOutcome::Ignored;
        }
        self.pending = false;
        self.retries = self.retries.saturating_add(1);
        if max != 0 && self.retries >= max {
            self.retries = 0;
            RetryOutcome::GiveUp
        } else {
            RetryOutcome::Retrying
        }
    }

    /// Rewind to an earlier stage; later stages are ignored
    pub fn go_back_to_query_stage(&mut self, stage: QueryStage) -> bool {
        if stage > self.stage {
            return false;
        }
        if stage == QueryStage::Configuration {
            self.configuration_requery = true;
        }
        self.stage = stage;
        self.pending = false;
        self.retries = 0;
        self.complete_notified = false;
        true
    }

    fn take_configuration_requery(&mut self) -> bool {
        std::mem::take(&mut self.configuration_requery)
    }

    /// True the first time it is called at `Complete`
    fn take_completion(&mut self) -> bool {
        if self.stage.is_complete() && !self.complete_notified {
            self.complete_notified = true;
            true
        } else {
            false
        }
    }
}

impl Node {
    /// Move discovery forward as far as possible without answers
    pub fn advance_queries(&mut self, env: &NodeEnv<'_>, out: &mut Outbox) {
        while !self.discovery.is_pending() {
            let stage = self.discovery.stage();
            if stage.is_complete() {
                if self.discovery.take_completion() {
                    info!(node_id = self.node_id, "Node discovery complete");
                    if self.is_sleeping() {
                        self.no_more_info_pending = true;
                    }
                    out.notify(Notification::NodeQueriesComplete {
                        home_id: self.home_id,
                        node_id: self.node_id,
                    });
                }
                return;
            }

            if self.request_stage(env, out, stage) {
                debug!(node_id = self.node_id, %stage, "Stage requests queued");
                out.messages.push((
                    MsgQueue::Query,
                    QueueItem::StageComplete {
                        node_id: self.node_id,
                        stage,
                    },
                ));
                self.discovery.set_pending();
            } else {
                self.complete_stage(out, stage);
            }
        }
    }

    /// Leave `stage` and continue
    pub fn query_stage_complete(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, stage: QueryStage) {
        if self.complete_stage(out, stage) {
            self.advance_queries(env, out);
        }
    }

    /// A stage request failed; try again or move on
    ///
    /// On [`RetryOutcome::Retrying`] the stage is requested again, so the
    /// caller must drop its queued stage marker first.
    pub fn query_stage_retry(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, stage: QueryStage) -> RetryOutcome {
        let outcome = self.discovery.query_stage_retry(stage, env.max_attempts);
        match outcome {
            RetryOutcome::Ignored => {}
            RetryOutcome::Retrying => {
                debug!(node_id = self.node_id, %stage, retries = self.discovery.retries(), "Retrying stage");
                self.advance_queries(env, out);
            }
            RetryOutcome::GiveUp => {
                warn!(node_id = self.node_id, %stage, "Giving up on stage");
                self.query_stage_complete(env, out, stage);
            }
        }
        outcome
    }

    /// Send discovery back to `stage`
    pub fn go_back_to_query_stage(&mut self, stage: QueryStage) -> bool {
        self.discovery.go_back_to_query_stage(stage)
    }

    fn complete_stage(&mut self, out: &mut Outbox, stage: QueryStage) -> bool {
        if !self.discovery.query_stage_complete(stage) {
            return false;
        }
        out.notify(Notification::QueryStageComplete {
            home_id: self.home_id,
            node_id: self.node_id,
            stage,
        });
        if stage == QueryStage::Instances {
            out.notify(Notification::EssentialNodeQueriesComplete {
                home_id: self.home_id,
                node_id: self.node_id,
            });
        }
        true
    }

    /// Queue the requests of a stage; false when there is nothing to ask
    fn request_stage(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, stage: QueryStage) -> bool {
        match stage {
            QueryStage::None | QueryStage::Complete => false,
            QueryStage::ProtocolInfo => {
                let msg = Message::new(
                    "Get Node Protocol Info",
                    self.node_id,
                    MessageType::Request,
                    Function::GetNodeProtocolInfo,
                );
                self.queue_controller_request(out, msg, &[self.node_id])
            }
            QueryStage::Neighbors => {
                let msg = Message::new(
                    "Get Routing Info",
                    self.node_id,
                    MessageType::Request,
                    Function::GetRoutingInfo,
                );
                // Keep bad links and non-repeaters in the list
                self.queue_controller_request(out, msg, &[self.node_id, 0, 0, 3])
            }
            QueryStage::WakeUp => {
                self.is_sleeping()
                    && self
                        .with_handler(env, out, command_class::WAKE_UP, |_, ctx| {
                            wake_up::request_interval(ctx, MsgQueue::Query)
                        })
                        .unwrap_or(false)
            }
            QueryStage::NodeInfo => {
                if self.node_info_received || self.is_controller {
                    return false;
                }
                let msg = Message::new(
                    "Request Node Info",
                    self.node_id,
                    MessageType::Request,
                    Function::RequestNodeInfo,
                )
                .expect_reply(Function::ApplicationUpdate);
                self.queue_controller_request(out, msg, &[self.node_id])
            }
            QueryStage::ManufacturerSpecific => {
                if self.is_controller {
                    return false;
                }
                let identity = self.manufacturer.is_none()
                    && self
                        .with_handler(env, out, command_class::MANUFACTURER_SPECIFIC, |_, ctx| {
                            manufacturer_specific::request_identity(ctx, MsgQueue::Query)
                        })
                        .unwrap_or(false);
                let secure = env.security_enabled
                    && self
                        .with_handler(env, out, command_class::SECURITY, |_, ctx| {
                            security::request_supported(ctx, MsgQueue::Query)
                        })
                        .unwrap_or(false);
                identity || secure
            }
            QueryStage::Versions => {
                let classes: Vec<u8> = self
                    .classes
                    .iter()
                    .filter(|(_, e)| !e.info.after_mark && e.handler.max_version() > 1)
                    .map(|(&id, _)| id)
                    .collect();
                !classes.is_empty()
                    && self
                        .with_handler(env, out, command_class::VERSION, |_, ctx| {
                            version::request_class_versions(ctx, &classes, MsgQueue::Query)
                        })
                        .unwrap_or(false)
            }
            QueryStage::Instances => {
                let classes: Vec<u8> = self
                    .classes
                    .iter()
                    .filter(|(_, e)| !e.info.after_mark)
                    .map(|(&id, _)| id)
                    .collect();
                self.with_handler(env, out, command_class::MULTI_INSTANCE, |_, ctx| {
                    multi_instance::request_instances(ctx, &classes, MsgQueue::Query)
                })
                .unwrap_or(false)
            }
            QueryStage::Static => self.request_state(env, out, RequestFlags::STATIC),
            QueryStage::Associations => {
                let count = self.group_count;
                count > 0
                    && self
                        .with_handler(env, out, command_class::ASSOCIATION, |_, ctx| {
                            association::request_all_groups(ctx, count, MsgQueue::Query)
                        })
                        .unwrap_or(false)
            }
            QueryStage::Session => self.request_state(env, out, RequestFlags::SESSION),
            QueryStage::Dynamic => self.request_state(env, out, RequestFlags::DYNAMIC),
            QueryStage::Configuration => {
                self.discovery.take_configuration_requery()
                    && self
                        .with_handler(env, out, command_class::CONFIGURATION, |_, ctx| {
                            configuration::request_all(ctx, MsgQueue::Query)
                        })
                        .unwrap_or(false)
            }
        }
    }

    fn queue_controller_request(&self, out: &mut Outbox, mut msg: Message, payload: &[u8]) -> bool {
        match msg.extend(payload) {
            Ok(()) => {
                out.send(MsgQueue::Query, msg);
                true
            }
            Err(e) => {
                warn!(node_id = self.node_id, "{} not queued: {}", msg.log_text(), e);
                false
            }
        }
    }

    /// Ask every supported class instance for one category of data
    fn request_state(&mut self, env: &NodeEnv<'_>, out: &mut Outbox, flags: RequestFlags) -> bool {
        if self.is_controller {
            return false;
        }
        let targets: Vec<(u8, u8)> = self
            .classes
            .iter()
            .filter(|(_, e)| !e.info.after_mark)
            .flat_map(|(&id, e)| (1..=e.info.instances).map(move |instance| (id, instance)))
            .collect();

        let mut queued = false;
        for (class, instance) in targets {
            queued |= self
                .with_handler(env, out, class, |h, ctx| {
                    h.request_state(ctx, flags, instance, MsgQueue::Query)
                })
                .unwrap_or(false);
        }
        queued
    }
}
