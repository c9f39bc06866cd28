//! Per-node value table

use std::collections::BTreeMap;
use std::sync::Arc;

use zwrust_types::{ValueGenre, ValueId};

use super::Value;

/// Values of one node keyed by their identity
#[derive(Debug, Default)]
pub struct ValueStore {
    values: BTreeMap<ValueId, Arc<Value>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value unless one with the same id exists
    ///
    /// Returns the stored value and whether it was newly added.
    pub fn add(&mut self, value: Value) -> (Arc<Value>, bool) {
        let id = value.id();
        if let Some(existing) = self.values.get(&id) {
            return (Arc::clone(existing), false);
        }
        let value = Arc::new(value);
        self.values.insert(id, Arc::clone(&value));
        (value, true)
    }

    pub fn get(&self, id: &ValueId) -> Option<Arc<Value>> {
        self.values.get(id).cloned()
    }

    /// Look up by command class, instance and index (any genre or type)
    pub fn find(&self, command_class_id: u8, instance: u8, index: u8) -> Option<Arc<Value>> {
        self.values
            .values()
            .find(|v| {
                let id = v.id();
                id.command_class_id == command_class_id && id.instance == instance && id.index == index
            })
            .cloned()
    }

    pub fn remove(&mut self, id: &ValueId) -> Option<Arc<Value>> {
        self.values.remove(id)
    }

    /// Drop every value of a command class; returns the removed ids
    pub fn remove_command_class(&mut self, command_class_id: u8) -> Vec<ValueId> {
        let removed: Vec<ValueId> = self
            .values
            .keys()
            .filter(|id| id.command_class_id == command_class_id)
            .copied()
            .collect();
        for id in &removed {
            self.values.remove(id);
        }
        removed
    }

    /// Values of one command class instance
    pub fn of_instance(&self, command_class_id: u8, instance: u8) -> Vec<Arc<Value>> {
        self.values
            .values()
            .filter(|v| v.id().command_class_id == command_class_id && v.id().instance == instance)
            .cloned()
            .collect()
    }

    pub fn of_genre(&self, genre: ValueGenre) -> Vec<Arc<Value>> {
        self.values
            .values()
            .filter(|v| v.genre() == genre)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Value>> {
        self.values.values()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use zwrust_types::ValueType;

    fn value(cc: u8, instance: u8, index: u8) -> Value {
        let id = ValueId::new(1, 7, ValueGenre::User, cc, instance, index, ValueType::Byte).unwrap();
        Value::new(id, "v")
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut store = ValueStore::new();
        let (first, added) = store.add(value(0x26, 1, 0));
        assert!(added);

        let (second, added) = store.add(value(0x26, 1, 0));
        assert!(!added);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_find_and_remove_class() {
        let mut store = ValueStore::new();
        store.add(value(0x26, 1, 0));
        store.add(value(0x26, 2, 0));
        store.add(value(0x80, 1, 0));

        assert!(store.find(0x26, 2, 0).is_some());
        assert!(store.find(0x26, 3, 0).is_none());
        assert_eq!(store.of_instance(0x26, 1).len(), 1);

        let removed = store.remove_command_class(0x26);
        assert_eq!(removed.len(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_removed_value_outlives_store() {
        let mut store = ValueStore::new();
        let (held, _) = store.add(value(0x25, 1, 0));
        store.remove(&held.id());

        // Notifications still holding the Arc keep a usable value
        assert_eq!(held.label(), "v");
        assert!(store.is_empty());
    }
}
