//! Value identity

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Coarse category of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueGenre {
    /// The single "basic" value every device maps to
    Basic,
    /// Values an ordinary user cares about
    User,
    /// Device configuration parameters
    Config,
    /// Protocol-level values
    System,
}

impl fmt::Display for ValueGenre {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Basic => "basic",
            Self::User => "user",
            Self::Config => "config",
            Self::System => "system",
        };
        f.write_str(name)
    }
}

/// Storage type of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Byte,
    Decimal,
    Int,
    List,
    Short,
    String,
    Button,
    Raw,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Byte => "byte",
            Self::Decimal => "decimal",
            Self::Int => "int",
            Self::List => "list",
            Self::Short => "short",
            Self::String => "string",
            Self::Button => "button",
            Self::Raw => "raw",
        };
        f.write_str(name)
    }
}

/// Compound key of one observable property
///
/// Unique across every driver in a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId {
    pub home_id: u32,
    pub node_id: u8,
    pub genre: ValueGenre,
    pub command_class_id: u8,
    pub instance: u8,
    pub index: u8,
    pub value_type: ValueType,
}

impl ValueId {
    /// Create a value id
    ///
    /// # Errors
    ///
    /// Instance 0 and node 0 are not addressable.
    pub fn new(
        home_id: u32,
        node_id: u8,
        genre: ValueGenre,
        command_class_id: u8,
        instance: u8,
        index: u8,
        value_type: ValueType,
    ) -> Result<Self> {
        if node_id == 0 {
            return Err(Error::Validation("node id 0 is not addressable".into()));
        }
        if instance == 0 {
            return Err(Error::Validation("instances are numbered from 1".into()));
        }

        Ok(Self {
            home_id,
            node_id,
            genre,
            command_class_id,
            instance,
            index,
            value_type,
        })
    }

    /// Same node, class and instance
    pub fn same_command_class(&self, other: &Self) -> bool {
        self.home_id == other.home_id
            && self.node_id == other.node_id
            && self.command_class_id == other.command_class_id
            && self.instance == other.instance
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Home 0x{:08X} Node {} CC 0x{:02X} Instance {} Index {} ({} {})",
            self.home_id,
            self.node_id,
            self.command_class_id,
            self.instance,
            self.index,
            self.genre,
            self.value_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn id(index: u8) -> ValueId {
        ValueId::new(0xC0FF_EE00, 5, ValueGenre::User, 0x25, 1, index, ValueType::Bool).unwrap()
    }

    #[test]
    fn test_value_id_identity() {
        let mut set = HashSet::new();
        set.insert(id(0));
        set.insert(id(0));
        set.insert(id(1));

        assert_eq!(set.len(), 2);
        assert!(id(0).same_command_class(&id(1)));
    }

    #[test]
    fn test_value_id_rejects_zero_instance() {
        assert!(ValueId::new(1, 5, ValueGenre::User, 0x25, 0, 0, ValueType::Bool).is_err());
        assert!(ValueId::new(1, 0, ValueGenre::User, 0x25, 1, 0, ValueType::Bool).is_err());
    }

    #[test]
    fn test_value_id_display() {
        assert_eq!(
            id(0).to_string(),
            "Home 0xC0FFEE00 Node 5 CC 0x25 Instance 1 Index 0 (user bool)"
        );
    }

    #[test]
    fn test_value_id_serde() {
        let json = serde_json::to_string(&id(3)).unwrap();
        let back: ValueId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id(3));
    }
}
