//! Medical records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{de_id, Entity, Extra, InsertPosition};
use crate::query::OrderBy;

/// A patient record filed by fire/EMS
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MedicalRecord {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub citizen_id: String,
    pub diagnosis: String,
    #[serde(default)]
    pub treatment: Option<String>,
    #[serde(default)]
    pub attending: Option<String>,
    #[serde(default)]
    pub blood_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Entity for MedicalRecord {
    const TABLE: &'static str = "medical_records";
    const DEFAULT_ORDER: OrderBy = OrderBy::desc("created_at");
    const INSERT_POSITION: InsertPosition = InsertPosition::Prepend;
    const FIELDS: &'static [&'static str] = &[
        "citizen_id",
        "diagnosis",
        "treatment",
        "attending",
        "blood_type",
    ];
    const REQUIRED_FIELDS: &'static [&'static str] = &["citizen_id", "diagnosis"];

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn label(&self) -> String {
        match &self.attending {
            Some(attending) => format!("{} ({})", self.diagnosis, attending),
            None => self.diagnosis.clone(),
        }
    }
}
