//! # zwrust
//!
//! Host-side driver for Z-Wave networks, speaking the Serial API to a USB
//! stick or a serial-over-TCP bridge.
//!
//! ## Features
//!
//! - Prioritised send queues with ACK, callback and report tracking
//! - Per-node discovery pipeline, resumable from a saved network snapshot
//! - Command class handlers that keep a typed value store per node
//! - Security (S0) encapsulation with nonce exchange
//! - Async/await API using Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use zwrust::{Driver, DriverConfig, Notification, TcpTransport, ValueData};
//!
//! #[tokio::main]
//! async fn main() -> zwrust::Result<()> {
//!     let mut driver = Driver::new(DriverConfig::default())?;
//!     let mut notifications = driver.take_notifications().expect("first call");
//!     driver.start(TcpTransport::new("192.168.1.50", 4001))?;
//!
//!     let handle = driver.handle();
//!     while let Some(notification) = notifications.recv().await {
//!         if let Notification::ValueAdded(value) = &notification {
//!             if value.label() == "Switch" {
//!                 handle.set_value(&value.id(), ValueData::Bool(true))?;
//!             }
//!         }
//!         if matches!(notification, Notification::AllNodesQueried { .. }) {
//!             break;
//!         }
//!     }
//!
//!     driver.stop().await
//! }
//! ```

pub mod command_classes;
pub mod config;
pub mod driver;
pub mod error;
pub mod node;
pub mod notification;
pub mod persist;
pub mod product;
pub mod value;

// Re-exports
pub use config::DriverConfig;
pub use driver::{Driver, DriverHandle};
pub use error::{Error, Result};
pub use node::Node;
pub use notification::{ErrorCode, Notification};
pub use product::{Localization, NoLocalization, NoProducts, ProductDatabase, ProductTable};
pub use value::{ListItem, Value, ValueData};

// Re-export lower layers
pub use zwrust_core::{Function, Message, MessageType};
pub use zwrust_transport::{HidDevice, HidTransport, MemoryPeer, MemoryTransport, TcpTransport, Transport};
pub use zwrust_types::{
    AssociationGroup, ManufacturerInfo, NetworkSnapshot, NodeProtocolInfo, ProductDescriptor, QueryStage,
    ValueGenre, ValueId, ValueType,
};
