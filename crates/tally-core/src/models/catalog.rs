//! Point-of-sale domain models

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{EntityKind, RecordId};
use crate::error::Result;

/// A typed entity stored as a record payload.
pub trait EntityModel: Serialize + DeserializeOwned {
    const KIND: EntityKind;

    /// Serialize into the opaque payload stored in a record
    fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserialize from a record payload
    fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}

/// A sellable catalog item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    /// Unit price in minor currency units
    pub price_cents: i64,
    pub stock: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
}

impl Product {
    #[must_use]
    pub fn new(name: impl Into<String>, price_cents: i64, stock: i64) -> Self {
        Self {
            name: name.into(),
            price_cents,
            stock,
            sku: None,
        }
    }

    #[must_use]
    pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }
}

impl EntityModel for Product {
    const KIND: EntityKind = EntityKind::Product;
}

/// How a sale was paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Other,
}

/// A completed checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    pub total_cents: i64,
    pub payment_method: PaymentMethod,
    /// Register-local completion time (Unix ms)
    pub completed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl EntityModel for Sale {
    const KIND: EntityKind = EntityKind::Sale;
}

/// One line of a sale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleItem {
    pub sale_id: RecordId,
    pub product_id: RecordId,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

impl SaleItem {
    pub const fn line_total_cents(&self) -> i64 {
        self.quantity.saturating_mul(self.unit_price_cents)
    }
}

impl EntityModel for SaleItem {
    const KIND: EntityKind = EntityKind::SaleItem;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn product_payload_omits_missing_sku() {
        let payload = Product::new("Espresso", 300, 40).to_payload().unwrap();
        assert_eq!(
            payload,
            json!({"name": "Espresso", "price_cents": 300, "stock": 40})
        );
    }

    #[test]
    fn sale_payload_roundtrips_payment_method() {
        let sale = Sale {
            total_cents: 900,
            payment_method: PaymentMethod::Card,
            completed_at: 1_700_000_000_000,
            note: None,
        };
        let payload = sale.to_payload().unwrap();
        assert_eq!(payload["payment_method"], json!("card"));
        assert_eq!(Sale::from_payload(&payload).unwrap(), sale);
    }

    #[test]
    fn sale_item_line_total() {
        let item = SaleItem {
            sale_id: RecordId::new(),
            product_id: RecordId::new(),
            quantity: 3,
            unit_price_cents: 250,
        };
        assert_eq!(item.line_total_cents(), 750);
    }
}
