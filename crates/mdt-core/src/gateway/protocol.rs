//! Realtime protocol message types
//!
//! Messages exchanged with the hosted realtime server. Frames are JSON text
//! in the Phoenix channel format (`topic`, `event`, `payload`, `ref`); the
//! `event` field selects the variant.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ChangeKind, RawChange};

/// Protocol version requested on connect
pub const PROTOCOL_VSN: &str = "1.0.0";

/// Topic used for socket-level heartbeats
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// Channel topic for a table in the public schema
pub fn table_topic(table: &str) -> String {
    format!("realtime:public:{}", table)
}

/// One postgres_changes subscription inside a join request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub event: String,
    pub schema: String,
    pub table: String,
}

/// Channel configuration sent with `phx_join`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinConfig {
    pub postgres_changes: Vec<ChangeFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub config: JoinConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// Messages sent to the realtime server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum ClientMessage {
    /// Join a table topic
    #[serde(rename = "phx_join")]
    Join {
        topic: String,
        payload: JoinPayload,
        #[serde(rename = "ref")]
        reference: String,
        join_ref: String,
    },

    /// Keep the socket alive
    #[serde(rename = "heartbeat")]
    Heartbeat {
        topic: String,
        payload: Value,
        #[serde(rename = "ref")]
        reference: String,
    },

    /// Leave a topic before closing
    #[serde(rename = "phx_leave")]
    Leave {
        topic: String,
        payload: Value,
        #[serde(rename = "ref")]
        reference: String,
    },
}

impl ClientMessage {
    /// Join every change on `table`
    pub fn join(table: &str, access_token: Option<&str>, reference: &str) -> Self {
        ClientMessage::Join {
            topic: table_topic(table),
            payload: JoinPayload {
                config: JoinConfig {
                    postgres_changes: vec![ChangeFilter {
                        event: "*".to_string(),
                        schema: "public".to_string(),
                        table: table.to_string(),
                    }],
                },
                access_token: access_token.map(str::to_string),
            },
            reference: reference.to_string(),
            join_ref: reference.to_string(),
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        ClientMessage::Heartbeat {
            topic: HEARTBEAT_TOPIC.to_string(),
            payload: Value::Object(Default::default()),
            reference: reference.to_string(),
        }
    }

    pub fn leave(table: &str, reference: &str) -> Self {
        ClientMessage::Leave {
            topic: table_topic(table),
            payload: Value::Object(Default::default()),
            reference: reference.to_string(),
        }
    }

    /// Encode as a JSON text frame
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Reply to a client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

impl ReplyPayload {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Best-effort human readable reason for an error reply
    pub fn reason(&self) -> String {
        self.response
            .get("reason")
            .or_else(|| self.response.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("join refused ({})", self.status))
    }
}

/// Row change inside a `postgres_changes` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeData {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesPayload {
    pub data: ChangeData,
}

impl From<ChangeData> for RawChange {
    fn from(data: ChangeData) -> Self {
        // Deletes carry an empty `record` object
        let new = match data.kind {
            ChangeKind::Delete => None,
            _ => data.record,
        };
        RawChange {
            event_type: data.kind,
            new,
            old: data.old_record,
        }
    }
}

/// Extension status notice sent after a join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPayload {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Messages received from the realtime server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    /// Reply to a join, heartbeat or leave
    #[serde(rename = "phx_reply")]
    Reply {
        topic: String,
        payload: ReplyPayload,
        #[serde(rename = "ref", default)]
        reference: Option<String>,
    },

    /// Row change notification
    #[serde(rename = "postgres_changes")]
    PostgresChanges {
        topic: String,
        payload: ChangesPayload,
    },

    /// Extension status
    #[serde(rename = "system")]
    System {
        topic: String,
        payload: SystemPayload,
    },

    /// Channel crashed server side
    #[serde(rename = "phx_error")]
    Error { topic: String },

    /// Channel closed server side
    #[serde(rename = "phx_close")]
    Close { topic: String },

    /// Presence, broadcast and anything else we do not consume
    #[serde(other)]
    Other,
}

impl ServerMessage {
    /// Decode a JSON text frame
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
