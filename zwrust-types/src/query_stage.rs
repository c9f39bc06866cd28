//! Discovery stages

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the per-node discovery pipeline, in execution order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum QueryStage {
    #[default]
    None,
    ProtocolInfo,
    Neighbors,
    WakeUp,
    NodeInfo,
    ManufacturerSpecific,
    Versions,
    Instances,
    Static,
    Associations,
    Session,
    Dynamic,
    Configuration,
    Complete,
}

impl QueryStage {
    /// Every stage in order
    pub const ALL: [QueryStage; 14] = [
        Self::None,
        Self::ProtocolInfo,
        Self::Neighbors,
        Self::WakeUp,
        Self::NodeInfo,
        Self::ManufacturerSpecific,
        Self::Versions,
        Self::Instances,
        Self::Static,
        Self::Associations,
        Self::Session,
        Self::Dynamic,
        Self::Configuration,
        Self::Complete,
    ];

    /// The following stage (`Complete` is terminal)
    pub fn next(self) -> Self {
        let pos = self as usize;
        Self::ALL.get(pos + 1).copied().unwrap_or(Self::Complete)
    }

    pub fn is_complete(self) -> bool {
        self == Self::Complete
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::ProtocolInfo => "ProtocolInfo",
            Self::Neighbors => "Neighbors",
            Self::WakeUp => "WakeUp",
            Self::NodeInfo => "NodeInfo",
            Self::ManufacturerSpecific => "ManufacturerSpecific",
            Self::Versions => "Versions",
            Self::Instances => "Instances",
            Self::Static => "Static",
            Self::Associations => "Associations",
            Self::Session => "Session",
            Self::Dynamic => "Dynamic",
            Self::Configuration => "Configuration",
            Self::Complete => "Complete",
        }
    }
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stage_order() {
        for pair in QueryStage::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].next(), pair[1]);
        }
    }

    #[test]
    fn test_complete_is_terminal() {
        assert_eq!(QueryStage::Complete.next(), QueryStage::Complete);
        assert!(QueryStage::Complete.is_complete());
    }
}
