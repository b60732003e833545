//! Typed change events

use serde::de::Error as _;

use crate::error::{SyncError, SyncResult};
use crate::gateway::{ChangeKind, RawChange};
use crate::models::{row_id, Entity};
use crate::query::SnapshotFilter;

/// A change to one record of `E`
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<E> {
    Inserted(E),
    Updated(E),
    Deleted(String),
}

impl<E: Entity> ChangeEvent<E> {
    /// Classify and decode a gateway notification
    pub fn from_raw(raw: &RawChange) -> SyncResult<Self> {
        match raw.event_type {
            ChangeKind::Insert => decode_row(raw).map(ChangeEvent::Inserted),
            ChangeKind::Update => decode_row(raw).map(ChangeEvent::Updated),
            ChangeKind::Delete => raw
                .old
                .as_ref()
                .and_then(row_id)
                .map(ChangeEvent::Deleted)
                .ok_or_else(|| {
                    SyncError::decode(
                        E::TABLE,
                        serde_json::Error::custom("delete notification without an old id"),
                    )
                }),
        }
    }

    /// Id of the affected record
    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::Inserted(record) | ChangeEvent::Updated(record) => record.id(),
            ChangeEvent::Deleted(id) => id,
        }
    }

    /// The event as seen through `filter`
    ///
    /// A record written outside the filter has left the filtered view, so
    /// it becomes a removal of its id.
    pub fn gated(self, filter: &SnapshotFilter) -> Self {
        match self {
            ChangeEvent::Inserted(record) | ChangeEvent::Updated(record)
                if !filter.matches_record(&record) =>
            {
                ChangeEvent::Deleted(record.id().to_string())
            }
            event => event,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Inserted(_) => ChangeKind::Insert,
            ChangeEvent::Updated(_) => ChangeKind::Update,
            ChangeEvent::Deleted(_) => ChangeKind::Delete,
        }
    }
}

fn decode_row<E: Entity>(raw: &RawChange) -> SyncResult<E> {
    let Some(ref row) = raw.new else {
        return Err(SyncError::decode(
            E::TABLE,
            serde_json::Error::custom("change notification without a new row"),
        ));
    };
    serde_json::from_value(row.clone()).map_err(|e| SyncError::decode(E::TABLE, e))
}
