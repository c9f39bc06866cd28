//! Command classes the driver can instantiate

use std::collections::BTreeMap;

use super::association::Association;
use super::basic::Basic;
use super::battery::Battery;
use super::central_scene::CentralScene;
use super::configuration::Configuration;
use super::manufacturer_specific::ManufacturerSpecific;
use super::multi_instance::MultiInstance;
use super::no_operation::NoOperation;
use super::node_naming::NodeNaming;
use super::security::Security;
use super::sensor_binary::SensorBinary;
use super::sensor_multilevel::SensorMultilevel;
use super::switch_binary::SwitchBinary;
use super::switch_multilevel::SwitchMultilevel;
use super::version::Version;
use super::wake_up::WakeUp;
use super::CommandClassHandler;

type Factory = fn() -> Box<dyn CommandClassHandler>;

fn factory<H: CommandClassHandler + Default + 'static>() -> Box<dyn CommandClassHandler> {
    Box::new(H::default())
}

/// Map of class id to handler constructor
///
/// Built once per driver. Classes missing here are ignored when nodes
/// report them.
#[derive(Debug, Clone, Default)]
pub struct CommandClassRegistry {
    factories: BTreeMap<u8, Factory>,
}

impl CommandClassRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(factory::<NoOperation>);
        registry.register(factory::<Basic>);
        registry.register(factory::<SwitchBinary>);
        registry.register(factory::<SwitchMultilevel>);
        registry.register(factory::<SensorBinary>);
        registry.register(factory::<SensorMultilevel>);
        registry.register(factory::<CentralScene>);
        registry.register(factory::<MultiInstance>);
        registry.register(factory::<Configuration>);
        registry.register(factory::<ManufacturerSpecific>);
        registry.register(factory::<NodeNaming>);
        registry.register(factory::<Battery>);
        registry.register(factory::<WakeUp>);
        registry.register(factory::<Association>);
        registry.register(factory::<Version>);
        registry.register(factory::<Security>);
        registry
    }

    /// Add or replace a handler constructor, keyed by the id it reports
    pub fn register(&mut self, factory: Factory) {
        let id = factory().id();
        self.factories.insert(id, factory);
    }

    /// Fresh handler for a class
    pub fn create(&self, command_class_id: u8) -> Option<Box<dyn CommandClassHandler>> {
        self.factories.get(&command_class_id).map(|f| f())
    }

    pub fn is_supported(&self, command_class_id: u8) -> bool {
        self.factories.contains_key(&command_class_id)
    }

    pub fn name(&self, command_class_id: u8) -> Option<&'static str> {
        self.create(command_class_id).map(|h| h.name())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use zwrust_core::constants::command_class;

    #[test]
    fn test_defaults() {
        let registry = CommandClassRegistry::with_defaults();
        assert_eq!(registry.len(), 16);
        assert!(registry.is_supported(command_class::SWITCH_BINARY));
        assert!(!registry.is_supported(command_class::CONTROLLER_REPLICATION));
        assert_eq!(registry.name(command_class::WAKE_UP), Some("COMMAND_CLASS_WAKE_UP"));
    }

    #[test]
    fn test_create_gives_fresh_handler() {
        let registry = CommandClassRegistry::with_defaults();
        let handler = registry.create(command_class::SWITCH_MULTILEVEL).unwrap();
        assert_eq!(handler.id(), command_class::SWITCH_MULTILEVEL);
        assert_eq!(handler.max_version(), 2);
        assert!(registry.create(0xF1).is_none());
    }
}
