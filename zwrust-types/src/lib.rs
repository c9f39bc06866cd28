//! Type definitions shared across zwrust crates

pub mod error;
pub mod node_info;
pub mod product;
pub mod query_stage;
pub mod snapshot;
pub mod value_id;

pub use error::{Error, Result};
pub use node_info::{AssociationGroup, Capabilities, NodeProtocolInfo, SecurityFlags};
pub use product::{ManufacturerInfo, ProductDescriptor};
pub use query_stage::QueryStage;
pub use snapshot::{CommandClassSnapshot, NetworkSnapshot, NodeSnapshot};
pub use value_id::{ValueGenre, ValueId, ValueType};
