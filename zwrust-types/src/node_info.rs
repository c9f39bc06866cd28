//! Node protocol information and association groups

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Error, Result};

bitflags! {
    /// Capability byte of a protocol info report
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Capabilities: u8 {
        const LISTENING = 0x80;
        const ROUTING = 0x40;
        const BAUD_MASK = 0x38;
        const VERSION_MASK = 0x07;
    }
}

bitflags! {
    /// Security byte of a protocol info report
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SecurityFlags: u8 {
        const SECURITY = 0x01;
        const CONTROLLER = 0x02;
        const SPECIFIC_DEVICE = 0x04;
        const ROUTING_SLAVE = 0x08;
        const BEAM_CAPABILITY = 0x10;
        const SENSOR_250MS = 0x20;
        const SENSOR_1000MS = 0x40;
        const OPTIONAL_FUNCTIONALITY = 0x80;
    }
}

/// Decoded `GetNodeProtocolInfo` response
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeProtocolInfo {
    pub capabilities: Capabilities,
    pub security: SecurityFlags,
    /// Speed extension bits of the reserved byte
    pub speed_extension: u8,
    pub basic: u8,
    pub generic: u8,
    pub specific: u8,
}

impl NodeProtocolInfo {
    /// Response payload size
    pub const SIZE: usize = 6;

    /// Decode the six response bytes
    ///
    /// # Errors
    ///
    /// Short payloads, and a zero generic class (node does not exist).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Parse(format!(
                "protocol info needs {} bytes, got {}",
                Self::SIZE,
                data.len()
            )));
        }
        if data[4] == 0 {
            return Err(Error::Validation("generic device class 0: node does not exist".into()));
        }

        Ok(Self {
            capabilities: Capabilities::from_bits_retain(data[0]),
            security: SecurityFlags::from_bits_retain(data[1]),
            speed_extension: data[2] & 0x07,
            basic: data[3],
            generic: data[4],
            specific: data[5],
        })
    }

    pub fn is_listening(&self) -> bool {
        self.capabilities.contains(Capabilities::LISTENING)
    }

    /// Frequently listening (FLiRS) nodes wake on beam and need no parking
    pub fn is_frequent_listening(&self) -> bool {
        self.security
            .intersects(SecurityFlags::SENSOR_250MS | SecurityFlags::SENSOR_1000MS)
    }

    pub fn is_routing(&self) -> bool {
        self.capabilities.contains(Capabilities::ROUTING)
    }

    pub fn is_beaming(&self) -> bool {
        self.security.contains(SecurityFlags::BEAM_CAPABILITY)
    }

    pub fn is_secure(&self) -> bool {
        self.security.contains(SecurityFlags::SECURITY)
    }

    /// Protocol version (1-based)
    pub fn version(&self) -> u8 {
        (self.capabilities & Capabilities::VERSION_MASK).bits() + 1
    }

    /// Maximum baud rate in bits per second
    pub fn max_baud_rate(&self) -> u32 {
        match self.speed_extension {
            1 => 100_000,
            2 => 200_000,
            _ if (self.capabilities & Capabilities::BAUD_MASK).bits() == 0x10 => 40_000,
            _ => 9_600,
        }
    }
}

impl fmt::Display for NodeProtocolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listening={} flirs={} routing={} beaming={} security={} baud={} version={} classes={:02X}/{:02X}/{:02X}",
            self.is_listening(),
            self.is_frequent_listening(),
            self.is_routing(),
            self.is_beaming(),
            self.is_secure(),
            self.max_baud_rate(),
            self.version(),
            self.basic,
            self.generic,
            self.specific
        )
    }
}

/// One association group of a node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssociationGroup {
    pub index: u8,
    pub label: String,
    pub max_associations: u8,
    pub members: BTreeSet<u8>,
}

impl AssociationGroup {
    pub fn new(index: u8, max_associations: u8) -> Self {
        Self {
            index,
            label: format!("Group {}", index),
            max_associations,
            members: BTreeSet::new(),
        }
    }

    /// Whether another member fits
    pub fn has_room(&self) -> bool {
        self.max_associations == 0 || self.members.len() < self.max_associations as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_listening_switch() {
        // Always-on routing switch, 40k, version 4, Binary Switch generic class
        let info = NodeProtocolInfo::parse(&[0xD3, 0x9C, 0x00, 0x04, 0x10, 0x01]).unwrap();

        assert!(info.is_listening());
        assert!(info.is_routing());
        assert!(info.is_beaming());
        assert!(!info.is_frequent_listening());
        assert!(!info.is_secure());
        assert_eq!(info.max_baud_rate(), 40_000);
        assert_eq!(info.version(), 4);
        assert_eq!(info.generic, 0x10);
    }

    #[test]
    fn test_parse_flirs_lock() {
        let info = NodeProtocolInfo::parse(&[0x53, 0x5D, 0x01, 0x04, 0x40, 0x03]).unwrap();

        assert!(!info.is_listening());
        assert!(info.is_frequent_listening());
        assert!(info.is_secure());
        assert_eq!(info.max_baud_rate(), 100_000);
    }

    #[test]
    fn test_parse_missing_node() {
        assert!(matches!(
            NodeProtocolInfo::parse(&[0, 0, 0, 0, 0, 0]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(NodeProtocolInfo::parse(&[0xD3]), Err(Error::Parse(_))));
    }

    #[test]
    fn test_association_group_room() {
        let mut group = AssociationGroup::new(1, 1);
        assert!(group.has_room());
        group.members.insert(1);
        assert!(!group.has_room());
        assert_eq!(group.label, "Group 1");
    }
}
