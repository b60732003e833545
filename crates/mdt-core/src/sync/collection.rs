//! Local entity collection
//!
//! Ordered, id-unique list of records held by one sync binding. Change
//! events are applied order-insensitively: inserts of known ids replace in
//! place, updates of unknown ids insert, deletes of unknown ids do nothing.
//! A record carrying an older `updated_at` than the held copy is ignored, so
//! a late echo of a mutation cannot roll back a newer direct response.

use super::event::ChangeEvent;
use crate::models::{Entity, InsertPosition};

#[derive(Debug, Clone)]
pub struct EntityCollection<E> {
    records: Vec<E>,
}

impl<E> Default for EntityCollection<E> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl<E: Entity> EntityCollection<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from snapshot rows, keeping their order
    ///
    /// Repeated ids collapse into the first position.
    pub fn from_snapshot(records: Vec<E>) -> Self {
        let mut collection = Self::new();
        collection.replace_all(records);
        collection
    }

    pub fn records(&self) -> &[E] {
        &self.records
    }

    pub fn into_records(self) -> Vec<E> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&E> {
        self.records.iter().find(|record| record.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|record| record.id() == id)
    }

    /// Apply a change event; returns whether the collection changed
    pub fn apply(&mut self, event: &ChangeEvent<E>) -> bool {
        match event {
            ChangeEvent::Inserted(record) | ChangeEvent::Updated(record) => {
                self.upsert(record.clone())
            }
            ChangeEvent::Deleted(id) => self.remove(id),
        }
    }

    /// Replace the record with the same id, or insert it
    ///
    /// New records land at the front or the back depending on the entity.
    pub fn upsert(&mut self, record: E) -> bool {
        match self.position(record.id()) {
            Some(index) => {
                if is_stale(&self.records[index], &record) {
                    return false;
                }
                self.records[index] = record;
            }
            None => match E::INSERT_POSITION {
                InsertPosition::Prepend => self.records.insert(0, record),
                InsertPosition::Append => self.records.push(record),
            },
        }
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(index) => {
                self.records.remove(index);
                true
            }
            None => false,
        }
    }

    /// Replace the whole collection with snapshot rows
    pub fn replace_all(&mut self, records: Vec<E>) {
        self.records.clear();
        for record in records {
            match self.position(record.id()) {
                Some(index) => {
                    if !is_stale(&self.records[index], &record) {
                        self.records[index] = record;
                    }
                }
                None => self.records.push(record),
            }
        }
    }
}

/// Incoming copy is older than the held one
fn is_stale<E: Entity>(held: &E, incoming: &E) -> bool {
    matches!(
        (held.updated_at(), incoming.updated_at()),
        (Some(held), Some(incoming)) if incoming < held
    )
}
