//! Manufacturer and product identity

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Entry of the product database
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductDescriptor {
    pub manufacturer_id: u16,
    pub product_type: u16,
    pub product_id: u16,
    pub manufacturer_name: String,
    pub product_name: String,
}

impl fmt::Display for ProductDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.manufacturer_name, self.product_name)
    }
}

/// Identity reported by a Manufacturer Specific report
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManufacturerInfo {
    pub manufacturer_id: u16,
    pub product_type: u16,
    pub product_id: u16,
    pub manufacturer_name: Option<String>,
    pub product_name: Option<String>,
}

impl ManufacturerInfo {
    /// Decode the six id bytes of a report (big-endian pairs)
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 6 {
            return Err(Error::Parse(format!(
                "manufacturer report needs 6 bytes, got {}",
                data.len()
            )));
        }

        Ok(Self {
            manufacturer_id: u16::from_be_bytes([data[0], data[1]]),
            product_type: u16::from_be_bytes([data[2], data[3]]),
            product_id: u16::from_be_bytes([data[4], data[5]]),
            manufacturer_name: None,
            product_name: None,
        })
    }

    /// Fill in names from a product database entry
    pub fn with_product(mut self, product: &ProductDescriptor) -> Self {
        self.manufacturer_name = Some(product.manufacturer_name.clone());
        self.product_name = Some(product.product_name.clone());
        self
    }
}

impl fmt::Display for ManufacturerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:04X}:0x{:04X}:0x{:04X}",
            self.manufacturer_id, self.product_type, self.product_id
        )?;
        if let (Some(m), Some(p)) = (&self.manufacturer_name, &self.product_name) {
            write!(f, " ({} {})", m, p)?;
        }
        Ok(())
    }
}
