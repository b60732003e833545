//! Real-estate records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{de_id, de_opt_id, Entity, Extra, InsertPosition};
use crate::query::OrderBy;

/// A property sale or transfer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertyTransaction {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub property_address: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub seller_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub buyer_id: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    /// pending, completed, cancelled
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Entity for PropertyTransaction {
    const TABLE: &'static str = "property_transactions";
    const DEFAULT_ORDER: OrderBy = OrderBy::desc("created_at");
    const INSERT_POSITION: InsertPosition = InsertPosition::Prepend;
    const FIELDS: &'static [&'static str] = &[
        "property_address",
        "seller_id",
        "buyer_id",
        "price",
        "status",
    ];
    const REQUIRED_FIELDS: &'static [&'static str] = &["property_address"];

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn label(&self) -> String {
        match self.price {
            Some(price) => format!("{} (${:.0})", self.property_address, price),
            None => self.property_address.clone(),
        }
    }
}
