//! Remote data gateway contract
//!
//! The hosted database is consumed through the [`Gateway`] trait: snapshot
//! queries, row mutations and a per-table change feed. Realtime services never
//! see the transport, only JSON rows and [`RawChange`] notifications.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryGateway`]: in-process tables, used by tests and local demos
//! - [`RemoteGateway`]: REST + realtime websocket against a hosted project

mod memory;
mod protocol;
mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::query::Query;

pub use memory::MemoryGateway;
pub use protocol::{ClientMessage, ServerMessage};
pub use remote::RemoteGateway;

/// Kind of row change reported by the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Untyped change notification as delivered by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub event_type: ChangeKind,
    /// Row after the change (insert, update)
    #[serde(default)]
    pub new: Option<Value>,
    /// Row before the change; at least `{id}` for deletes
    #[serde(default)]
    pub old: Option<Value>,
}

impl RawChange {
    pub fn insert(row: Value) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn update(row: Value) -> Self {
        Self {
            event_type: ChangeKind::Update,
            new: Some(row),
            old: None,
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            event_type: ChangeKind::Delete,
            new: None,
            old: Some(serde_json::json!({ "id": id.into() })),
        }
    }
}

/// Channel status reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Subscription acknowledged; changes will flow
    Subscribed,
    /// Subscription refused or dropped
    ChannelError(String),
}

/// Messages flowing over a change feed channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Status(ChannelStatus),
    Change(RawChange),
}

/// Receiving end of a change feed
///
/// Dropping the channel closes it; the producing side notices through
/// [`ChannelSender::closed`] and releases the upstream subscription.
#[derive(Debug)]
pub struct Channel {
    messages: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl Channel {
    /// Create a connected sender/channel pair
    pub fn pair() -> (ChannelSender, Channel) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSender { tx }, Channel { messages: rx })
    }

    /// Next message, or `None` once the producer is gone
    pub async fn next(&mut self) -> Option<ChannelMessage> {
        self.messages.recv().await
    }
}

/// Producing end of a change feed, held by gateway implementations
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

impl ChannelSender {
    /// Report a status change; returns false if the channel was dropped
    pub fn status(&self, status: ChannelStatus) -> bool {
        self.tx.send(ChannelMessage::Status(status)).is_ok()
    }

    /// Deliver a change; returns false if the channel was dropped
    pub fn change(&self, change: RawChange) -> bool {
        self.tx.send(ChannelMessage::Change(change)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiving side has been dropped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Hosted data gateway
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Fetch the current rows of `table`
    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Value>, GatewayError>;

    /// Insert a row, returning it as stored (with its assigned id)
    async fn insert(&self, table: &str, record: Value) -> Result<Value, GatewayError>;

    /// Patch the row with `id`, returning it as stored
    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value, GatewayError>;

    /// Delete the row with `id`
    async fn delete(&self, table: &str, id: &str) -> Result<(), GatewayError>;

    /// Open a change feed for every event on `table`
    ///
    /// The returned channel reports `Subscribed` once the gateway has
    /// acknowledged the subscription.
    async fn subscribe_changes(&self, table: &str) -> Result<Channel, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_kind_wire_names() {
        assert_eq!(serde_json::to_value(ChangeKind::Insert).unwrap(), json!("INSERT"));
        let kind: ChangeKind = serde_json::from_value(json!("DELETE")).unwrap();
        assert_eq!(kind, ChangeKind::Delete);
    }

    #[test]
    fn test_raw_delete_carries_id() {
        let change = RawChange::delete("u2");
        assert_eq!(change.event_type, ChangeKind::Delete);
        assert_eq!(change.old, Some(json!({"id": "u2"})));
        assert!(change.new.is_none());
    }

    #[tokio::test]
    async fn test_channel_pair() {
        let (sender, mut channel) = Channel::pair();
        assert!(sender.status(ChannelStatus::Subscribed));
        assert!(sender.change(RawChange::insert(json!({"id": "1"}))));

        assert_eq!(
            channel.next().await,
            Some(ChannelMessage::Status(ChannelStatus::Subscribed))
        );
        assert!(matches!(channel.next().await, Some(ChannelMessage::Change(_))));

        drop(channel);
        assert!(sender.is_closed());
        assert!(!sender.change(RawChange::delete("1")));
    }
}
