//! Persisted network state
//!
//! Enough to resume discovery after a restart without re-interviewing every
//! node from scratch. Stored as JSON in `zwcfg_0x<home id>.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    error::Result, AssociationGroup, ManufacturerInfo, NodeProtocolInfo, QueryStage,
};

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Per-class data learned during discovery
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandClassSnapshot {
    pub version: u8,
    pub instances: u8,
    pub secure: bool,
}

/// One node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: u8,
    pub query_stage: QueryStage,
    pub protocol_info: Option<NodeProtocolInfo>,
    pub command_classes: BTreeMap<u8, CommandClassSnapshot>,
    pub manufacturer: Option<ManufacturerInfo>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub associations: Vec<AssociationGroup>,
}

impl NodeSnapshot {
    /// Stage to resume discovery from
    ///
    /// Everything up to `Instances` is cached; values are not, so nodes
    /// that got further restart at `Static`.
    pub fn resume_stage(&self) -> QueryStage {
        self.query_stage.min(QueryStage::Static)
    }
}

/// Whole network of one controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub version: u32,
    pub home_id: u32,
    pub controller_node_id: u8,
    pub saved_at: DateTime<Utc>,
    pub nodes: Vec<NodeSnapshot>,
}

impl NetworkSnapshot {
    pub fn new(home_id: u32, controller_node_id: u8) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            home_id,
            controller_node_id,
            saved_at: Utc::now(),
            nodes: Vec::new(),
        }
    }

    /// File name for a home id
    pub fn file_name(home_id: u32) -> String {
        format!("zwcfg_0x{:08x}.json", home_id)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn node(&self, node_id: u8) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}
