//! Entity records for MDT
//!
//! Every table the dashboard syncs is described by a record struct that
//! implements [`Entity`]. The trait carries the per-table configuration the
//! realtime engine needs (table name, default snapshot ordering, where new
//! rows land in a local collection, writable columns), so one generic
//! service handles all of them.
//!
//! Records keep unknown columns in a flattened `extra` map, which lets a
//! schema gain columns without breaking decoding on older clients.

mod dispatch;
mod legal;
mod medical;
mod payload;
mod property;

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::query::OrderBy;

pub use dispatch::{Citizen, Division, Equipment, Unit, Vehicle};
pub use legal::{Certificate, Firearm, Summons, Warrant};
pub use medical::MedicalRecord;
pub use payload::{validate_create, validate_patch};
pub use property::PropertyTransaction;

/// Extra columns not modelled by a record struct
pub type Extra = serde_json::Map<String, Value>;

/// Where a record that is new to a local collection is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    /// Newest first (feeds, logs)
    Prepend,
    /// Appended after existing rows (alphabetical rosters)
    Append,
}

/// A record type synced from one gateway table
pub trait Entity: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Gateway table name
    const TABLE: &'static str;
    /// Ordering requested for snapshots
    const DEFAULT_ORDER: OrderBy;
    /// Placement of records that are new to a local collection
    const INSERT_POSITION: InsertPosition;
    /// Columns a client may write
    const FIELDS: &'static [&'static str];
    /// Columns a create payload must carry
    const REQUIRED_FIELDS: &'static [&'static str];

    fn id(&self) -> &str;

    fn updated_at(&self) -> Option<DateTime<Utc>>;

    /// Short human-readable description
    fn label(&self) -> String;
}

/// Columns assigned by the gateway, never written by clients
pub const SERVER_FIELDS: &[&str] = &["id", "created_at", "updated_at"];

/// Accept string or numeric primary keys, always stored as a string
pub(crate) fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

/// Same as [`de_id`] for optional foreign keys
pub(crate) fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(Option::<RawId>::deserialize(deserializer)?.map(|raw| match raw {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    }))
}

/// Nullable columns whose null means the type's default
pub(crate) fn de_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Extract a row identifier from a JSON object
pub fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
