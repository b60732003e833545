//! Justice records: warrants, summons, certificates, the gun registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{de_id, de_opt_id, Entity, Extra, InsertPosition};
use crate::query::OrderBy;

/// An arrest or search warrant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Warrant {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub citizen_id: String,
    pub reason: String,
    /// active, served, revoked
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub issued_by: Option<String>,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Entity for Warrant {
    const TABLE: &'static str = "warrants";
    const DEFAULT_ORDER: OrderBy = OrderBy::desc("created_at");
    const INSERT_POSITION: InsertPosition = InsertPosition::Prepend;
    const FIELDS: &'static [&'static str] = &[
        "citizen_id",
        "reason",
        "status",
        "issued_by",
        "agency",
        "expires_at",
    ];
    const REQUIRED_FIELDS: &'static [&'static str] = &["citizen_id", "reason"];

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn label(&self) -> String {
        format!(
            "{} [{}]",
            self.reason,
            self.status.as_deref().unwrap_or("active")
        )
    }
}

/// A court summons
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Summons {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub citizen_id: String,
    pub offense: String,
    #[serde(default)]
    pub court_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub issued_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Entity for Summons {
    const TABLE: &'static str = "summons";
    const DEFAULT_ORDER: OrderBy = OrderBy::desc("created_at");
    const INSERT_POSITION: InsertPosition = InsertPosition::Prepend;
    const FIELDS: &'static [&'static str] =
        &["citizen_id", "offense", "court_date", "status", "issued_by"];
    const REQUIRED_FIELDS: &'static [&'static str] = &["citizen_id", "offense"];

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn label(&self) -> String {
        match self.court_date {
            Some(date) => format!("{} (court {})", self.offense, date.format("%Y-%m-%d")),
            None => self.offense.clone(),
        }
    }
}

/// A licence or certificate issued to a citizen
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Certificate {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub citizen_id: String,
    /// Certificate kind (firearms, hunting, pilot, bar)
    pub certificate_type: String,
    #[serde(default)]
    pub issued_by: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Entity for Certificate {
    const TABLE: &'static str = "certificates";
    const DEFAULT_ORDER: OrderBy = OrderBy::desc("created_at");
    const INSERT_POSITION: InsertPosition = InsertPosition::Prepend;
    const FIELDS: &'static [&'static str] = &[
        "citizen_id",
        "certificate_type",
        "issued_by",
        "expires_at",
        "status",
    ];
    const REQUIRED_FIELDS: &'static [&'static str] = &["citizen_id", "certificate_type"];

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn label(&self) -> String {
        self.certificate_type.clone()
    }
}

/// A gun registry entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Firearm {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub serial_number: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub owner_id: Option<String>,
    /// registered, stolen, seized
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Entity for Firearm {
    const TABLE: &'static str = "gun_registry";
    const DEFAULT_ORDER: OrderBy = OrderBy::asc("serial_number");
    const INSERT_POSITION: InsertPosition = InsertPosition::Append;
    const FIELDS: &'static [&'static str] = &["serial_number", "model", "owner_id", "status"];
    const REQUIRED_FIELDS: &'static [&'static str] = &["serial_number"];

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn label(&self) -> String {
        match &self.model {
            Some(model) => format!("{} {}", model, self.serial_number),
            None => self.serial_number.clone(),
        }
    }
}
