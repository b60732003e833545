//! Payload validation
//!
//! Create and update payloads are checked against the entity's column list
//! before they are sent, so malformed writes fail locally instead of costing
//! a gateway round trip.

use serde_json::Value;

use super::{Entity, SERVER_FIELDS};

/// Validate a create payload for `E`
///
/// The payload must be an object of known columns, carry every required
/// column with a non-null value, leave server-assigned columns alone and
/// decode into the record shape once an id is assigned.
pub fn validate_create<E: Entity>(data: &Value) -> Result<(), String> {
    let Some(object) = data.as_object() else {
        return Err("payload must be a JSON object".to_string());
    };

    check_columns::<E>(object)?;

    for field in E::REQUIRED_FIELDS {
        match object.get(*field) {
            None | Some(Value::Null) => return Err(format!("missing required field '{}'", field)),
            Some(_) => {}
        }
    }

    // Shape check: the gateway will add the id, so stand one in.
    let mut probe = object.clone();
    probe.insert("id".to_string(), Value::String(String::new()));
    serde_json::from_value::<E>(Value::Object(probe))
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Validate an update patch for `E`
pub fn validate_patch<E: Entity>(patch: &Value) -> Result<(), String> {
    let Some(object) = patch.as_object() else {
        return Err("patch must be a JSON object".to_string());
    };

    if object.is_empty() {
        return Err("patch is empty".to_string());
    }

    check_columns::<E>(object)?;

    for field in E::REQUIRED_FIELDS {
        if matches!(object.get(*field), Some(Value::Null)) {
            return Err(format!("required field '{}' cannot be cleared", field));
        }
    }

    Ok(())
}

fn check_columns<E: Entity>(object: &serde_json::Map<String, Value>) -> Result<(), String> {
    for key in object.keys() {
        if SERVER_FIELDS.contains(&key.as_str()) {
            return Err(format!("field '{}' is assigned by the gateway", key));
        }
        if !E::FIELDS.contains(&key.as_str()) {
            return Err(format!("unknown field '{}' for {}", key, E::TABLE));
        }
    }
    Ok(())
}
