//! Lookup collaborators consumed by command class handlers
//!
//! The product database and label translations live outside the driver.
//! Handlers reach them through [`Collaborators`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use zwrust_types::ProductDescriptor;

use crate::error::{Error, Result};

/// Product identity lookup
#[cfg_attr(test, mockall::automock)]
pub trait ProductDatabase: Send + Sync {
    fn get_product(
        &self,
        manufacturer_id: u16,
        product_type: u16,
        product_id: u16,
    ) -> Option<ProductDescriptor>;
}

/// Label translation lookup
#[cfg_attr(test, mockall::automock)]
pub trait Localization: Send + Sync {
    fn get_label(&self, id: &str, lang: &str) -> Option<String>;
}

/// Database that knows nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProducts;

impl ProductDatabase for NoProducts {
    fn get_product(&self, _: u16, _: u16, _: u16) -> Option<ProductDescriptor> {
        None
    }
}

/// Labels stay in their built-in language
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLocalization;

impl Localization for NoLocalization {
    fn get_label(&self, _: &str, _: &str) -> Option<String> {
        None
    }
}

/// In-memory product database loaded from JSON
///
/// ```
/// use zwrust::{ProductDatabase, ProductTable};
///
/// let table = ProductTable::from_json(r#"[{
///     "manufacturer_id": 134, "product_type": 3, "product_id": 6,
///     "manufacturer_name": "Aeotec", "product_name": "Smart Switch"
/// }]"#).unwrap();
///
/// assert_eq!(table.get_product(0x86, 3, 6).unwrap().product_name, "Smart Switch");
/// ```
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(from = "Vec<ProductDescriptor>", into = "Vec<ProductDescriptor>")]
pub struct ProductTable {
    products: HashMap<(u16, u16, u16), ProductDescriptor>,
}

impl ProductTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, product: ProductDescriptor) {
        self.products.insert(
            (product.manufacturer_id, product.product_type, product.product_id),
            product,
        );
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

impl From<Vec<ProductDescriptor>> for ProductTable {
    fn from(products: Vec<ProductDescriptor>) -> Self {
        let mut table = Self::new();
        for product in products {
            table.insert(product);
        }
        table
    }
}

impl From<ProductTable> for Vec<ProductDescriptor> {
    fn from(table: ProductTable) -> Self {
        table.products.into_values().collect()
    }
}

impl ProductDatabase for ProductTable {
    fn get_product(
        &self,
        manufacturer_id: u16,
        product_type: u16,
        product_id: u16,
    ) -> Option<ProductDescriptor> {
        self.products
            .get(&(manufacturer_id, product_type, product_id))
            .cloned()
    }
}

/// External lookups shared by every handler of a driver
#[derive(Clone)]
pub struct Collaborators {
    pub products: Arc<dyn ProductDatabase>,
    pub localization: Arc<dyn Localization>,
    pub language: String,
}

impl Collaborators {
    /// Translated label, falling back to `default`
    pub fn label(&self, id: &str, default: &str) -> String {
        self.localization
            .get_label(id, &self.language)
            .unwrap_or_else(|| default.to_string())
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            products: Arc::new(NoProducts),
            localization: Arc::new(NoLocalization),
            language: "en".to_string(),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}
