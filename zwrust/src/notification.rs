//! Events delivered to the application watcher

use std::fmt;
use std::sync::Arc;

use zwrust_types::{QueryStage, ValueId};

use crate::value::Value;

/// Why a transmission failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Secure frame could not be built or authenticated
    Crypto,
    /// No reply within the timeout after every attempt
    Timeout,
    /// Node did not acknowledge
    NoAck,
    /// Controller reported a failed transmission
    Failed,
}

/// Typed driver event
#[derive(Debug, Clone)]
pub enum Notification {
    ValueAdded(Arc<Value>),
    ValueRemoved(ValueId),
    ValueChanged(Arc<Value>),
    ValueRefreshed(Arc<Value>),
    NodeAdded { home_id: u32, node_id: u8 },
    NodeRemoved { home_id: u32, node_id: u8 },
    /// Protocol info received
    NodeProtocolInfo { home_id: u32, node_id: u8 },
    /// Name or location reported
    NodeNaming { home_id: u32, node_id: u8 },
    /// Basic Set sent by a node
    NodeEvent { home_id: u32, node_id: u8, event: u8 },
    /// Central Scene activation
    CentralScene {
        home_id: u32,
        node_id: u8,
        scene: u8,
        key_attributes: u8,
    },
    QueryStageComplete {
        home_id: u32,
        node_id: u8,
        stage: QueryStage,
    },
    /// Identity, versions and instances are known
    EssentialNodeQueriesComplete { home_id: u32, node_id: u8 },
    /// Discovery reached `Complete`
    NodeQueriesComplete { home_id: u32, node_id: u8 },
    /// Every node has finished discovery
    AllNodesQueried { home_id: u32 },
    DriverReady { home_id: u32, controller_node_id: u8 },
    DriverFailed { reason: String },
    /// Link lost or reopened
    DriverReset { home_id: u32 },
    Error {
        home_id: u32,
        node_id: u8,
        code: ErrorCode,
    },
}

impl Notification {
    /// Node the event is about, if any
    pub fn node_id(&self) -> Option<u8> {
        match self {
            Self::ValueAdded(v) | Self::ValueChanged(v) | Self::ValueRefreshed(v) => Some(v.id().node_id),
            Self::ValueRemoved(id) => Some(id.node_id),
            Self::NodeAdded { node_id, .. }
            | Self::NodeRemoved { node_id, .. }
            | Self::NodeProtocolInfo { node_id, .. }
            | Self::NodeNaming { node_id, .. }
            | Self::NodeEvent { node_id, .. }
            | Self::CentralScene { node_id, .. }
            | Self::QueryStageComplete { node_id, .. }
            | Self::EssentialNodeQueriesComplete { node_id, .. }
            | Self::NodeQueriesComplete { node_id, .. }
            | Self::Error { node_id, .. } => Some(*node_id),
            Self::DriverReady {
                controller_node_id, ..
            } => Some(*controller_node_id),
            Self::AllNodesQueried { .. } | Self::DriverFailed { .. } | Self::DriverReset { .. } => None,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValueAdded(v) => write!(f, "ValueAdded {}", v.id()),
            Self::ValueRemoved(id) => write!(f, "ValueRemoved {}", id),
            Self::ValueChanged(v) => write!(f, "ValueChanged {} ({})", v.id(), v),
            Self::ValueRefreshed(v) => write!(f, "ValueRefreshed {} ({})", v.id(), v),
            Self::QueryStageComplete { node_id, stage, .. } => {
                write!(f, "QueryStageComplete node {} {}", node_id, stage)
            }
            Self::DriverFailed { reason } => write!(f, "DriverFailed: {}", reason),
            other => match other.node_id() {
                Some(node) => write!(f, "{} node {}", variant_name(other), node),
                None => f.write_str(variant_name(other)),
            },
        }
    }
}

fn variant_name(n: &Notification) -> &'static str {
    match n {
        Notification::ValueAdded(_) => "ValueAdded",
        Notification::ValueRemoved(_) => "ValueRemoved",
        Notification::ValueChanged(_) => "ValueChanged",
        Notification::ValueRefreshed(_) => "ValueRefreshed",
        Notification::NodeAdded { .. } => "NodeAdded",
        Notification::NodeRemoved { .. } => "NodeRemoved",
        Notification::NodeProtocolInfo { .. } => "NodeProtocolInfo",
        Notification::NodeNaming { .. } => "NodeNaming",
        Notification::NodeEvent { .. } => "NodeEvent",
        Notification::CentralScene { .. } => "CentralScene",
        Notification::QueryStageComplete { .. } => "QueryStageComplete",
        Notification::EssentialNodeQueriesComplete { .. } => "EssentialNodeQueriesComplete",
        Notification::NodeQueriesComplete { .. } => "NodeQueriesComplete",
        Notification::AllNodesQueried { .. } => "AllNodesQueried",
        Notification::DriverReady { .. } => "DriverReady",
        Notification::DriverFailed { .. } => "DriverFailed",
        Notification::DriverReset { .. } => "DriverReset",
        Notification::Error { .. } => "Error",
    }
}
