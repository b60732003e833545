//! Subscription bookkeeping
//!
//! Each realtime service keeps one registry mapping subscriber ids to
//! callback sets. Dispatch works on a snapshot of the registry (a list of
//! shared callback sets), so callbacks may subscribe or unsubscribe while an
//! event is being delivered without disturbing that delivery.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::event::ChangeEvent;
use crate::error::SyncError;

type RecordHandler<E> = Box<dyn Fn(&E) + Send + Sync>;
type DeleteHandler = Box<dyn Fn(&str) + Send + Sync>;
type ConnectedHandler = Box<dyn Fn() + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&SyncError) + Send + Sync>;

/// Callback set registered by one subscriber
///
/// Every handler is optional; events without a handler are skipped for
/// that subscriber.
pub struct Callbacks<E> {
    on_insert: Option<RecordHandler<E>>,
    on_update: Option<RecordHandler<E>>,
    on_delete: Option<DeleteHandler>,
    on_connected: Option<ConnectedHandler>,
    on_disconnected: Option<ConnectedHandler>,
    on_error: Option<ErrorHandler>,
}

impl<E> Default for Callbacks<E> {
    fn default() -> Self {
        Self {
            on_insert: None,
            on_update: None,
            on_delete: None,
            on_connected: None,
            on_disconnected: None,
            on_error: None,
        }
    }
}

impl<E> fmt::Debug for Callbacks<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_insert", &self.on_insert.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl<E> Callbacks<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert(mut self, f: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.on_insert = Some(Box::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Box::new(f));
        self
    }

    pub fn on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Box::new(f));
        self
    }

    /// Runs when the feed is closed locally (`disconnect`, auto-disconnect)
    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Invoke the handler matching `event`, if any
    pub(crate) fn dispatch(&self, event: &ChangeEvent<E>) {
        match event {
            ChangeEvent::Inserted(record) => {
                if let Some(ref f) = self.on_insert {
                    f(record);
                }
            }
            ChangeEvent::Updated(record) => {
                if let Some(ref f) = self.on_update {
                    f(record);
                }
            }
            ChangeEvent::Deleted(id) => {
                if let Some(ref f) = self.on_delete {
                    f(id);
                }
            }
        }
    }

    pub(crate) fn notify_connected(&self) {
        if let Some(ref f) = self.on_connected {
            f();
        }
    }

    pub(crate) fn notify_disconnected(&self) {
        if let Some(ref f) = self.on_disconnected {
            f();
        }
    }

    pub(crate) fn notify_error(&self, error: &SyncError) {
        if let Some(ref f) = self.on_error {
            f(error);
        }
    }
}

/// Opaque subscriber identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for a subscriber of `table`
    ///
    /// Built from the table and the current time, with a random suffix so
    /// two subscribers created in the same millisecond stay distinct.
    pub fn generate(table: &str) -> Self {
        let suffix = Uuid::new_v4().to_string();
        Self(format!(
            "{}-{}-{}",
            table,
            Utc::now().timestamp_millis(),
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registration token, distinguishes successive registrations of one id
pub(crate) type Token = u64;

struct Entry<E> {
    id: SubscriberId,
    token: Token,
    callbacks: Arc<Callbacks<E>>,
}

/// Subscriber id to callback set table, in registration order
pub struct SubscriptionRegistry<E> {
    entries: Vec<Entry<E>>,
    next_token: Token,
}

impl<E> Default for SubscriptionRegistry<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_token: 1,
        }
    }
}

impl<E> SubscriptionRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callbacks` under `id`, replacing any earlier registration
    pub(crate) fn insert(&mut self, id: SubscriberId, callbacks: Arc<Callbacks<E>>) -> Token {
        let token = self.next_token;
        self.next_token += 1;

        match self.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.token = token;
                entry.callbacks = callbacks;
            }
            None => self.entries.push(Entry {
                id,
                token,
                callbacks,
            }),
        }
        token
    }

    /// Remove the registration of `id` made with `token`
    ///
    /// A stale token (the id was registered again since) leaves the newer
    /// registration in place. Returns whether anything was removed.
    pub(crate) fn remove(&mut self, id: &SubscriberId, token: Token) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !(entry.id == *id && entry.token == token));
        self.entries.len() != before
    }

    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.entries.iter().any(|entry| entry.id == *id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Callback sets to deliver to, detached from the registry
    pub(crate) fn snapshot(&self) -> Vec<Arc<Callbacks<E>>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(&entry.callbacks))
            .collect()
    }
}
