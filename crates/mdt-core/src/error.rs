//! Error handling for the sync layer
//!
//! `GatewayError` describes a failure talking to the hosted data gateway.
//! `SyncError` is what services and bindings hand back to their callers; it
//! is `Clone` because channel faults are broadcast to every subscriber and
//! each binding keeps its own copy of the last error.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors reported by a gateway implementation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// The gateway answered with a non-success status
    #[error("Gateway returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The request could not be sent or the response never arrived
    #[error("Gateway request failed: {0}")]
    Transport(String),

    /// The response arrived but could not be understood
    #[error("Invalid gateway response: {0}")]
    InvalidResponse(String),

    /// Realtime socket failure
    #[error("Realtime connection error: {0}")]
    Realtime(String),

    /// Gateway is not configured or refused the operation outright
    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Status { status, .. } => *status >= 500 || *status == 429,
            GatewayError::Transport(_) | GatewayError::Realtime(_) => true,
            GatewayError::InvalidResponse(_) | GatewayError::Other(_) => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            GatewayError::InvalidResponse(error.to_string())
        } else {
            GatewayError::Transport(error.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Realtime(error.to_string())
    }
}

/// Mutation kinds, used for error context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by realtime services and sync bindings
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Snapshot fetch failed
    #[error("Failed to load '{table}': {source}")]
    Query {
        table: &'static str,
        #[source]
        source: GatewayError,
    },

    /// Create, update or delete failed
    #[error("Failed to {op} '{table}' record: {source}")]
    Mutation {
        table: &'static str,
        op: MutationOp,
        #[source]
        source: GatewayError,
    },

    /// Change feed could not be established or dropped
    #[error("Change feed for '{table}' failed: {message}")]
    Channel { table: &'static str, message: String },

    /// Payload rejected before it reached the gateway
    #[error("Invalid {table} payload: {reason}")]
    InvalidPayload { table: &'static str, reason: String },

    /// Gateway row did not match the entity shape
    #[error("Could not decode '{table}' row: {source}")]
    Decode {
        table: &'static str,
        #[source]
        source: Arc<serde_json::Error>,
    },
}

impl SyncError {
    pub(crate) fn decode(table: &'static str, source: serde_json::Error) -> Self {
        SyncError::Decode {
            table,
            source: Arc::new(source),
        }
    }

    /// Table the failing operation targeted
    pub fn table(&self) -> &'static str {
        match self {
            SyncError::Query { table, .. }
            | SyncError::Mutation { table, .. }
            | SyncError::Channel { table, .. }
            | SyncError::InvalidPayload { table, .. }
            | SyncError::Decode { table, .. } => table,
        }
    }

    /// Check if the caller can reasonably retry the same operation
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Query { source, .. } | SyncError::Mutation { source, .. } => {
                source.is_transient()
            }
            SyncError::Channel { .. } => true,
            SyncError::InvalidPayload { .. } | SyncError::Decode { .. } => false,
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SyncError::Query { .. } => Some("Refresh the view to fetch the snapshot again."),
            SyncError::Channel { .. } => {
                Some("Reconnect the change feed; live updates are paused until then.")
            }
            SyncError::InvalidPayload { .. } => {
                Some("Fix the highlighted fields and submit again.")
            }
            SyncError::Mutation { source, .. } if source.is_transient() => {
                Some("The gateway may be busy. Try again in a moment.")
            }
            _ => None,
        }
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_display() {
        let err = SyncError::Query {
            table: "units",
            source: GatewayError::Status {
                status: 503,
                message: "upstream unavailable".to_string(),
            },
        };

        let msg = err.to_string();
        assert!(msg.contains("units"));
        assert!(msg.contains("503"));
        assert!(err.is_retryable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_mutation_error_display() {
        let err = SyncError::Mutation {
            table: "vehicles",
            op: MutationOp::Update,
            source: GatewayError::Status {
                status: 409,
                message: "duplicate plate".to_string(),
            },
        };

        assert_eq!(
            err.to_string(),
            "Failed to update 'vehicles' record: Gateway returned status 409: duplicate plate"
        );
        assert!(!err.is_retryable());
        assert_eq!(err.table(), "vehicles");
    }

    #[test]
    fn test_invalid_payload_not_retryable() {
        let err = SyncError::InvalidPayload {
            table: "citizens",
            reason: "missing field 'first_name'".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("first_name"));
    }

    #[test]
    fn test_gateway_error_transience() {
        assert!(GatewayError::Transport("reset".into()).is_transient());
        assert!(GatewayError::Status {
            status: 429,
            message: String::new()
        }
        .is_transient());
        assert!(!GatewayError::Status {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!GatewayError::Other("not configured".into()).is_transient());
    }

    #[test]
    fn test_decode_error_is_clone() {
        let source = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err = SyncError::decode("units", source);
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
