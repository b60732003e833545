//! Dispatch records: citizens, vehicles, units, divisions, equipment

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{de_id, de_null_default, de_opt_id, Entity, Extra, InsertPosition};
use crate::query::OrderBy;

/// A citizen known to the agencies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citizen {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    /// Driver licence status (valid, suspended, revoked)
    #[serde(default)]
    pub license_status: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Citizen {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

impl Entity for Citizen {
    const TABLE: &'static str = "citizens";
    const DEFAULT_ORDER: OrderBy = OrderBy::asc("last_name");
    const INSERT_POSITION: InsertPosition = InsertPosition::Append;
    const FIELDS: &'static [&'static str] = &[
        "first_name",
        "last_name",
        "date_of_birth",
        "gender",
        "phone",
        "address",
        "license_status",
        "notes",
    ];
    const REQUIRED_FIELDS: &'static [&'static str] = &["first_name", "last_name"];

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn label(&self) -> String {
        self.full_name()
    }
}

/// A registered vehicle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vehicle {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub plate: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    /// Owning citizen
    #[serde(default, deserialize_with = "de_opt_id")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub registration_status: Option<String>,
    #[serde(default)]
    pub insurance_status: Option<String>,
    #[serde(default, deserialize_with = "de_null_default")]
    pub stolen: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Entity for Vehicle {
    const TABLE: &'static str = "vehicles";
    const DEFAULT_ORDER: OrderBy = OrderBy::asc("plate");
    const INSERT_POSITION: InsertPosition = InsertPosition::Append;
    const FIELDS: &'static [&'static str] = &[
        "plate",
        "model",
        "color",
        "owner_id",
        "registration_status",
        "insurance_status",
        "stolen",
    ];
    const REQUIRED_FIELDS: &'static [&'static str] = &["plate"];

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn label(&self) -> String {
        match &self.model {
            Some(model) => format!("{} ({})", self.plate, model),
            None => self.plate.clone(),
        }
    }
}

/// An on-duty unit (patrol car, engine, ambulance)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Unit {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub callsign: Option<String>,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub division_id: Option<String>,
    /// Duty status (available, busy, out of service)
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "de_null_default")]
    pub members: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Entity for Unit {
    const TABLE: &'static str = "units";
    const DEFAULT_ORDER: OrderBy = OrderBy::desc("created_at");
    const INSERT_POSITION: InsertPosition = InsertPosition::Prepend;
    const FIELDS: &'static [&'static str] = &[
        "name",
        "callsign",
        "agency",
        "division_id",
        "status",
        "members",
    ];
    const REQUIRED_FIELDS: &'static [&'static str] = &["name"];

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn label(&self) -> String {
        match (&self.callsign, &self.status) {
            (Some(callsign), Some(status)) => format!("{} {} [{}]", callsign, self.name, status),
            (Some(callsign), None) => format!("{} {}", callsign, self.name),
            (None, Some(status)) => format!("{} [{}]", self.name, status),
            (None, None) => self.name.clone(),
        }
    }
}

/// A division within an agency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Division {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Entity for Division {
    const TABLE: &'static str = "divisions";
    const DEFAULT_ORDER: OrderBy = OrderBy::asc("name");
    const INSERT_POSITION: InsertPosition = InsertPosition::Append;
    const FIELDS: &'static [&'static str] = &["name", "agency", "description"];
    const REQUIRED_FIELDS: &'static [&'static str] = &["name", "agency"];

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn label(&self) -> String {
        self.name.clone()
    }
}

/// A tracked piece of agency equipment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Equipment {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub assigned_unit_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Entity for Equipment {
    const TABLE: &'static str = "equipment";
    const DEFAULT_ORDER: OrderBy = OrderBy::asc("name");
    const INSERT_POSITION: InsertPosition = InsertPosition::Append;
    const FIELDS: &'static [&'static str] = &[
        "name",
        "category",
        "serial_number",
        "agency",
        "assigned_unit_id",
        "status",
    ];
    const REQUIRED_FIELDS: &'static [&'static str] = &["name", "agency"];

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn label(&self) -> String {
        match &self.serial_number {
            Some(serial) => format!("{} #{}", self.name, serial),
            None => self.name.clone(),
        }
    }
}
