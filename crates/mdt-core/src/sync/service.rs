//! Entity realtime service
//!
//! One `RealtimeService<E>` owns the change feed for one table. Any number of
//! local subscribers register callback sets with it; the service opens at
//! most one gateway channel regardless of how many subscribers there are and
//! fans each change out to all of them.
//!
//! The channel runs in a spawned task that only holds a weak reference to
//! the service. Every task is tagged with a generation number; `disconnect`
//! (and every fresh `connect`) bumps the generation so late messages from a
//! superseded task are ignored.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::event::ChangeEvent;
use super::registry::{Callbacks, SubscriberId, SubscriptionRegistry, Token};
use crate::error::{MutationOp, SyncError, SyncResult};
use crate::gateway::{Channel, ChannelMessage, ChannelStatus, Gateway, RawChange};
use crate::models::{validate_create, validate_patch, Entity};
use crate::query::{Query, SnapshotFilter};

/// State of the shared change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Exponential backoff for re-opening a failed change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after `current`
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

/// Per-service lifecycle policies
///
/// The default keeps a feed open until `disconnect` is called and never
/// retries a failed feed on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Close the feed when the last subscriber leaves
    pub auto_disconnect: bool,
    /// Re-open a failed feed with backoff
    pub reconnect: Option<ReconnectPolicy>,
}

/// Deregistration handle returned by [`RealtimeService::subscribe`]
///
/// Calling [`Unsubscribe::unsubscribe`] more than once is harmless.
/// Dropping the handle does not unsubscribe.
pub struct Unsubscribe {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Unsubscribe {
    fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    pub fn unsubscribe(&self) {
        let action = self
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(action) = action {
            action();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self
            .action
            .lock()
            .map(|action| action.is_some())
            .unwrap_or(false);
        f.debug_struct("Unsubscribe").field("pending", &pending).finish()
    }
}

struct ServiceState<E> {
    connection: ConnectionState,
    registry: SubscriptionRegistry<E>,
    channel_task: Option<JoinHandle<()>>,
    generation: u64,
    last_error: Option<SyncError>,
}

struct Inner<E> {
    gateway: Arc<dyn Gateway>,
    options: ServiceOptions,
    state: Mutex<ServiceState<E>>,
    status: watch::Sender<ConnectionState>,
}

/// Shared realtime gateway for entity `E`
///
/// Cloning is cheap; clones share the feed, the registry and the
/// connection state.
pub struct RealtimeService<E: Entity> {
    inner: Arc<Inner<E>>,
}

impl<E: Entity> Clone for RealtimeService<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Entity> std::fmt::Debug for RealtimeService<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeService")
            .field("table", &E::TABLE)
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<E: Entity> RealtimeService<E> {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self::with_options(gateway, ServiceOptions::default())
    }

    pub fn with_options(gateway: Arc<dyn Gateway>, options: ServiceOptions) -> Self {
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                gateway,
                options,
                state: Mutex::new(ServiceState {
                    connection: ConnectionState::Disconnected,
                    registry: SubscriptionRegistry::new(),
                    channel_task: None,
                    generation: 0,
                    last_error: None,
                }),
                status,
            }),
        }
    }

    pub fn table(&self) -> &'static str {
        E::TABLE
    }

    pub fn options(&self) -> ServiceOptions {
        self.inner.options
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().connection
    }

    /// Observe connection state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    /// Last channel failure, cleared once a feed is acknowledged
    pub fn last_error(&self) -> Option<SyncError> {
        self.inner.lock().last_error.clone()
    }

    /// Open the shared change feed
    ///
    /// Opens nothing new when the feed is already open or opening, and in
    /// every case waits until the feed is acknowledged or fails. A pending
    /// backoff retry is replaced by an immediate attempt.
    pub async fn connect(&self) -> SyncResult<()> {
        let mut status = {
            let mut state = self.inner.lock();
            match state.connection {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => {}
                ConnectionState::Disconnected => {
                    if let Some(task) = state.channel_task.take() {
                        // Pending retry; a direct connect replaces it
                        task.abort();
                    }
                    state.generation += 1;
                    state.last_error = None;
                    let generation = state.generation;
                    self.inner.set_connection(&mut state, ConnectionState::Connecting);
                    state.channel_task = Some(tokio::spawn(run_channel(
                        Arc::downgrade(&self.inner),
                        generation,
                    )));
                    info!(table = E::TABLE, "Connecting change feed");
                }
            }
            self.inner.status.subscribe()
        };

        loop {
            let current = *status.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => return Err(self.connect_error()),
                ConnectionState::Connecting => {}
            }
            if status.changed().await.is_err() {
                return Err(self.connect_error());
            }
        }
    }

    fn connect_error(&self) -> SyncError {
        self.last_error().unwrap_or_else(|| SyncError::Channel {
            table: E::TABLE,
            message: "feed closed before it was acknowledged".to_string(),
        })
    }

    /// Tear the change feed down
    ///
    /// Registered subscribers stay registered and are served again after the
    /// next `connect`.
    pub fn disconnect(&self) {
        self.inner.teardown();
    }

    /// Register `callbacks` under `id`
    ///
    /// A later registration under the same id replaces this one. When the
    /// feed is already connected, `on_connected` runs before this returns.
    pub fn subscribe(&self, id: SubscriberId, callbacks: Callbacks<E>) -> Unsubscribe {
        let callbacks = Arc::new(callbacks);
        let (token, connected) = {
            let mut state = self.inner.lock();
            let token = state.registry.insert(id.clone(), Arc::clone(&callbacks));
            (token, state.connection == ConnectionState::Connected)
        };
        debug!(table = E::TABLE, subscriber = %id, "Subscriber registered");

        if connected {
            callbacks.notify_connected();
        }

        let inner = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.unsubscribe(&id, token);
            }
        })
    }

    /// Fetch the current rows, ordered by the entity's default sort key
    pub async fn get_all(&self, filter: Option<&SnapshotFilter>) -> SyncResult<Vec<E>> {
        let query = Query::new(filter.cloned(), E::DEFAULT_ORDER);
        let rows = self
            .inner
            .gateway
            .query(E::TABLE, &query)
            .await
            .map_err(|source| SyncError::Query {
                table: E::TABLE,
                source,
            })?;

        debug!(table = E::TABLE, rows = rows.len(), "Snapshot fetched");
        rows.into_iter().map(decode::<E>).collect()
    }

    /// Insert a record, returning it as stored
    pub async fn create(&self, data: Value) -> SyncResult<E> {
        validate_create::<E>(&data).map_err(|reason| SyncError::InvalidPayload {
            table: E::TABLE,
            reason,
        })?;

        let row = self
            .inner
            .gateway
            .insert(E::TABLE, data)
            .await
            .map_err(|source| mutation_error::<E>(MutationOp::Create, source))?;
        decode(row)
    }

    /// Patch a record, returning it as stored
    pub async fn update(&self, id: &str, patch: Value) -> SyncResult<E> {
        validate_patch::<E>(&patch).map_err(|reason| SyncError::InvalidPayload {
            table: E::TABLE,
            reason,
        })?;

        let row = self
            .inner
            .gateway
            .update(E::TABLE, id, patch)
            .await
            .map_err(|source| mutation_error::<E>(MutationOp::Update, source))?;
        decode(row)
    }

    pub async fn delete(&self, id: &str) -> SyncResult<()> {
        self.inner
            .gateway
            .delete(E::TABLE, id)
            .await
            .map_err(|source| mutation_error::<E>(MutationOp::Delete, source))
    }
}

fn decode<E: Entity>(row: Value) -> SyncResult<E> {
    serde_json::from_value(row).map_err(|e| SyncError::decode(E::TABLE, e))
}

fn mutation_error<E: Entity>(op: MutationOp, source: crate::error::GatewayError) -> SyncError {
    SyncError::Mutation {
        table: E::TABLE,
        op,
        source,
    }
}

impl<E: Entity> Inner<E> {
    fn lock(&self) -> MutexGuard<'_, ServiceState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connection(&self, state: &mut ServiceState<E>, connection: ConnectionState) {
        state.connection = connection;
        self.status.send_if_modified(|current| {
            if *current == connection {
                false
            } else {
                *current = connection;
                true
            }
        });
    }

    fn teardown(&self) {
        let (task, callbacks) = {
            let mut state = self.lock();
            state.generation += 1;
            let was_open = state.connection != ConnectionState::Disconnected;
            self.set_connection(&mut state, ConnectionState::Disconnected);
            let callbacks = if was_open {
                state.registry.snapshot()
            } else {
                Vec::new()
            };
            (state.channel_task.take(), callbacks)
        };
        if let Some(task) = task {
            task.abort();
            info!(table = E::TABLE, "Change feed disconnected");
        }
        for callbacks in &callbacks {
            callbacks.notify_disconnected();
        }
    }

    fn unsubscribe(&self, id: &SubscriberId, token: Token) {
        let idle = {
            let mut state = self.lock();
            if !state.registry.remove(id, token) {
                return;
            }
            state.registry.is_empty() && state.connection != ConnectionState::Disconnected
        };
        debug!(table = E::TABLE, subscriber = %id, "Subscriber removed");

        if idle && self.options.auto_disconnect {
            debug!(table = E::TABLE, "No subscribers left, closing feed");
            self.teardown();
        }
    }

    /// Returns false when `generation` is no longer current
    fn mark_connected(&self, generation: u64) -> bool {
        let callbacks = {
            let mut state = self.lock();
            if state.generation != generation {
                return false;
            }
            if state.connection == ConnectionState::Connected {
                return true;
            }
            if self.options.auto_disconnect && state.registry.is_empty() {
                // Everyone left while the feed was opening
                state.generation += 1;
                state.channel_task = None;
                self.set_connection(&mut state, ConnectionState::Disconnected);
                debug!(table = E::TABLE, "No subscribers left, closing feed");
                return false;
            }
            state.last_error = None;
            self.set_connection(&mut state, ConnectionState::Connected);
            state.registry.snapshot()
        };

        info!(
            table = E::TABLE,
            subscribers = callbacks.len(),
            "Change feed connected"
        );
        for callbacks in &callbacks {
            callbacks.notify_connected();
        }
        true
    }

    fn deliver(&self, generation: u64, raw: &RawChange) {
        let event = match ChangeEvent::<E>::from_raw(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(table = E::TABLE, "Skipping change: {}", e);
                return;
            }
        };

        let callbacks = {
            let state = self.lock();
            if state.generation != generation {
                return;
            }
            state.registry.snapshot()
        };

        debug!(
            table = E::TABLE,
            kind = ?event.kind(),
            id = event.id(),
            subscribers = callbacks.len(),
            "Dispatching change"
        );
        for callbacks in &callbacks {
            callbacks.dispatch(&event);
        }
    }

    /// Record a feed failure; returns false when `generation` is stale
    fn fail(&self, generation: u64, message: String) -> bool {
        let error = SyncError::Channel {
            table: E::TABLE,
            message,
        };
        let callbacks = {
            let mut state = self.lock();
            if state.generation != generation {
                return false;
            }
            state.last_error = Some(error.clone());
            self.set_connection(&mut state, ConnectionState::Disconnected);
            if self.options.reconnect.is_none() {
                // The task is finishing; nothing left to abort
                state.channel_task = None;
            }
            state.registry.snapshot()
        };

        warn!(table = E::TABLE, "{}", error);
        for callbacks in &callbacks {
            callbacks.notify_error(&error);
        }
        true
    }

    /// Move back to `Connecting` before a retry
    fn begin_retry(&self, generation: u64) -> bool {
        let mut state = self.lock();
        if state.generation != generation || state.connection != ConnectionState::Disconnected {
            return false;
        }
        self.set_connection(&mut state, ConnectionState::Connecting);
        true
    }
}

impl<E> Drop for Inner<E> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = state.channel_task.take() {
            task.abort();
        }
    }
}

/// Channel task: open the feed, pump it, and retry per policy
async fn run_channel<E: Entity>(inner: Weak<Inner<E>>, generation: u64) {
    let mut backoff: Option<Duration> = None;

    loop {
        let Some(service) = inner.upgrade() else {
            return;
        };
        let gateway = Arc::clone(&service.gateway);
        let policy = service.options.reconnect;
        drop(service);

        let failure = match gateway.subscribe_changes(E::TABLE).await {
            Ok(channel) => pump(&inner, generation, channel, &mut backoff).await,
            Err(e) => e.to_string(),
        };

        let Some(service) = inner.upgrade() else {
            return;
        };
        if !service.fail(generation, failure) {
            return;
        }
        let Some(policy) = policy else {
            return;
        };
        drop(service);

        let delay = backoff.map_or(policy.initial_delay, |d| policy.next_delay(d));
        backoff = Some(delay);
        debug!(table = E::TABLE, delay_ms = delay.as_millis() as u64, "Retrying change feed");
        tokio::time::sleep(delay).await;

        match inner.upgrade() {
            Some(service) if service.begin_retry(generation) => {}
            _ => return,
        }
    }
}

/// Forward channel messages until the feed fails; returns the failure
async fn pump<E: Entity>(
    inner: &Weak<Inner<E>>,
    generation: u64,
    mut channel: Channel,
    backoff: &mut Option<Duration>,
) -> String {
    while let Some(message) = channel.next().await {
        let Some(service) = inner.upgrade() else {
            break;
        };
        match message {
            ChannelMessage::Status(ChannelStatus::Subscribed) => {
                *backoff = None;
                if !service.mark_connected(generation) {
                    break;
                }
            }
            ChannelMessage::Status(ChannelStatus::ChannelError(message)) => return message,
            ChannelMessage::Change(raw) => service.deliver(generation, &raw),
        }
    }
    "change feed closed".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use crate::models::Unit;
    use crate::sync::SyncBinding;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn setup() -> (Arc<MemoryGateway>, RealtimeService<Unit>) {
        let gateway = Arc::new(MemoryGateway::new().with_rows(
            "units",
            vec![json!({"id": "u1", "name": "Alpha", "agency": "lspd", "created_at": "2024-01-01T00:00:00Z"})],
        ));
        let service = RealtimeService::new(gateway.clone() as Arc<dyn Gateway>);
        (gateway, service)
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn count(counter: &Arc<AtomicUsize>) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn bump(counter: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_connect_notifies_subscribers() {
        let (gateway, service) = setup();
        let connected = counter();
        let on_connected = bump(&connected);
        let _handle = service.subscribe(
            SubscriberId::generate("units"),
            Callbacks::new().on_connected(on_connected),
        );

        assert_eq!(service.state(), ConnectionState::Disconnected);
        service.connect().await.unwrap();

        assert_eq!(service.state(), ConnectionState::Connected);
        assert_eq!(count(&connected), 1);
        assert_eq!(gateway.channel_opens("units"), 1);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (gateway, service) = setup();
        gateway.hold_acknowledgements(true);

        let first = tokio::spawn({
            let service = service.clone();
            async move { service.connect().await }
        });
        eventually(|| service.state() == ConnectionState::Connecting).await;

        let second = tokio::spawn({
            let service = service.clone();
            async move { service.connect().await }
        });
        eventually(|| gateway.open_channels("units") == 1).await;
        assert_eq!(gateway.acknowledge("units"), 1);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        service.connect().await.unwrap();

        assert_eq!(gateway.channel_opens("units"), 1);
    }

    #[tokio::test]
    async fn test_subscribe_when_connected_fires_immediately() {
        let (_gateway, service) = setup();
        service.connect().await.unwrap();

        let connected = counter();
        let on_connected = bump(&connected);
        let _handle = service.subscribe(
            SubscriberId::generate("units"),
            Callbacks::new().on_connected(on_connected),
        );

        assert_eq!(count(&connected), 1);
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let (_gateway, service) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            handles.push(service.subscribe(
                SubscriberId::generate("units"),
                Callbacks::new().on_insert(move |unit: &Unit| {
                    seen.lock().unwrap().push(unit.clone());
                }),
            ));
        }
        service.connect().await.unwrap();

        let created = service.create(json!({"name": "Bravo"})).await.unwrap();
        eventually(|| seen.lock().unwrap().len() == 3).await;

        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|unit| *unit == created));
        assert_eq!(service.subscriber_count(), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (gateway, service) = setup();
        let inserts = counter();
        let on_insert = bump(&inserts);
        let handle = service.subscribe(
            SubscriberId::generate("units"),
            Callbacks::new().on_insert(move |_| on_insert()),
        );
        service.connect().await.unwrap();

        handle.unsubscribe();
        handle.unsubscribe();
        assert_eq!(service.subscriber_count(), 0);

        gateway.emit("units", RawChange::insert(json!({"id": "u9", "name": "Zulu"})));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count(&inserts), 0);
        // Feed stays open for future subscribers
        assert_eq!(service.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_stale_handle_keeps_newer_registration() {
        let (_gateway, service) = setup();
        let id = SubscriberId::new("units-shared");

        let old = service.subscribe(id.clone(), Callbacks::new());
        let _new = service.subscribe(id.clone(), Callbacks::new());
        old.unsubscribe();

        assert_eq!(service.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_during_dispatch() {
        let (gateway, service) = setup();
        let first_hits = counter();
        let second_hits = counter();

        let second_handle: Arc<Mutex<Option<Unsubscribe>>> = Arc::new(Mutex::new(None));
        let first = {
            let hits = Arc::clone(&first_hits);
            let second_handle = Arc::clone(&second_handle);
            service.subscribe(
                SubscriberId::new("first"),
                Callbacks::new().on_insert(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if let Some(handle) = second_handle.lock().unwrap().as_ref() {
                        handle.unsubscribe();
                    }
                }),
            )
        };
        let second = {
            let hits = Arc::clone(&second_hits);
            service.subscribe(
                SubscriberId::new("second"),
                Callbacks::new().on_insert(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        *second_handle.lock().unwrap() = Some(second);
        service.connect().await.unwrap();

        gateway.emit("units", RawChange::insert(json!({"id": "u2", "name": "Bravo"})));
        eventually(|| count(&second_hits) == 1).await;
        assert_eq!(count(&first_hits), 1);

        gateway.emit("units", RawChange::insert(json!({"id": "u3", "name": "Charlie"})));
        eventually(|| count(&first_hits) == 2).await;
        assert_eq!(count(&second_hits), 1);
        first.unsubscribe();
    }

    #[tokio::test]
    async fn test_channel_error_broadcasts_and_allows_reconnect() {
        let (gateway, service) = setup();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let _handle = {
            let errors = Arc::clone(&errors);
            service.subscribe(
                SubscriberId::generate("units"),
                Callbacks::new().on_error(move |e: &SyncError| {
                    errors.lock().unwrap().push(e.clone());
                }),
            )
        };
        service.connect().await.unwrap();

        gateway.fail_channel("units", "replication slot lost");
        eventually(|| errors.lock().unwrap().len() == 1).await;

        assert_eq!(service.state(), ConnectionState::Disconnected);
        let err = service.last_error().unwrap();
        assert!(matches!(err, SyncError::Channel { table: "units", .. }));
        assert!(err.to_string().contains("replication slot lost"));

        service.connect().await.unwrap();
        assert_eq!(gateway.channel_opens("units"), 2);
        assert!(service.last_error().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_failure_fails_connect() {
        let (gateway, service) = setup();
        let errors = counter();
        let on_error = bump(&errors);
        let _handle = service.subscribe(
            SubscriberId::generate("units"),
            Callbacks::new().on_error(move |_| on_error()),
        );

        gateway.fail_next_subscribe("realtime disabled");
        let err = service.connect().await.unwrap_err();

        assert!(err.to_string().contains("realtime disabled"));
        assert_eq!(count(&errors), 1);
        assert_eq!(service.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_closes_feed() {
        let (gateway, service) = setup();
        service.connect().await.unwrap();
        assert_eq!(gateway.open_channels("units"), 1);

        service.disconnect();
        service.disconnect();

        assert_eq!(service.state(), ConnectionState::Disconnected);
        eventually(|| gateway.open_channels("units") == 0).await;
    }

    #[tokio::test]
    async fn test_auto_disconnect_when_idle() {
        let gateway = Arc::new(MemoryGateway::new());
        let service: RealtimeService<Unit> = RealtimeService::with_options(
            gateway.clone(),
            ServiceOptions {
                auto_disconnect: true,
                reconnect: None,
            },
        );

        let a = service.subscribe(SubscriberId::new("a"), Callbacks::new());
        let b = service.subscribe(SubscriberId::new("b"), Callbacks::new());
        service.connect().await.unwrap();

        a.unsubscribe();
        assert_eq!(service.state(), ConnectionState::Connected);
        b.unsubscribe();
        assert_eq!(service.state(), ConnectionState::Disconnected);
        eventually(|| gateway.open_channels("units") == 0).await;
    }

    #[tokio::test]
    async fn test_auto_disconnect_when_binding_leaves_before_ack() {
        let gateway = Arc::new(MemoryGateway::new());
        let service: RealtimeService<Unit> = RealtimeService::with_options(
            gateway.clone(),
            ServiceOptions {
                auto_disconnect: true,
                reconnect: None,
            },
        );

        {
            let _binding = SyncBinding::activate(&service, None);
        }
        assert_eq!(service.subscriber_count(), 0);

        eventually(|| gateway.channel_opens("units") == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(service.state(), ConnectionState::Disconnected);
        eventually(|| gateway.open_channels("units") == 0).await;
    }

    #[tokio::test]
    async fn test_disconnect_notifies_subscribers() {
        let (_gateway, service) = setup();
        let disconnected = counter();
        service.subscribe(
            SubscriberId::new("a"),
            Callbacks::new().on_disconnected(bump(&disconnected)),
        );
        service.connect().await.unwrap();

        service.disconnect();
        service.disconnect();

        assert_eq!(count(&disconnected), 1);
    }

    #[tokio::test]
    async fn test_reconnect_policy_reopens_feed() {
        let gateway = Arc::new(MemoryGateway::new());
        let service: RealtimeService<Unit> = RealtimeService::with_options(
            gateway.clone(),
            ServiceOptions {
                auto_disconnect: false,
                reconnect: Some(ReconnectPolicy {
                    initial_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(40),
                }),
            },
        );
        let connected = counter();
        let errors = counter();
        let on_connected = bump(&connected);
        let on_error = bump(&errors);
        let _handle = service.subscribe(
            SubscriberId::generate("units"),
            Callbacks::new()
                .on_connected(on_connected)
                .on_error(move |_| on_error()),
        );
        service.connect().await.unwrap();

        gateway.fail_channel("units", "socket reset");
        eventually(|| count(&connected) == 2).await;

        assert_eq!(count(&errors), 1);
        assert_eq!(gateway.channel_opens("units"), 2);
        assert_eq!(service.state(), ConnectionState::Connected);

        service.disconnect();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(gateway.channel_opens("units"), 2);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.next_delay(Duration::from_secs(1)),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.next_delay(Duration::from_secs(20)),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_watch_state_transitions() {
        let (gateway, service) = setup();
        let mut states = service.watch_state();
        gateway.hold_acknowledgements(true);

        let connect = tokio::spawn({
            let service = service.clone();
            async move { service.connect().await }
        });

        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connecting);

        eventually(|| gateway.acknowledge("units") == 1).await;
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
        connect.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_get_all_filters_and_orders() {
        let gateway = Arc::new(MemoryGateway::new().with_rows(
            "units",
            vec![
                json!({"id": "u1", "name": "Alpha", "agency": "lspd", "created_at": "2024-01-01T00:00:00Z"}),
                json!({"id": "u2", "name": "Bravo", "agency": "lspd", "created_at": "2024-01-02T00:00:00Z"}),
                json!({"id": "u3", "name": "Engine 1", "agency": "lsfd", "created_at": "2024-01-03T00:00:00Z"}),
            ],
        ));
        let service: RealtimeService<Unit> = RealtimeService::new(gateway);

        let units = service
            .get_all(Some(&SnapshotFilter::agency("lspd")))
            .await
            .unwrap();
        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u2", "u1"]);

        assert_eq!(service.get_all(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_query_failure_is_query_error() {
        let (gateway, service) = setup();
        gateway.fail_next_query("statement timeout");

        let err = service.get_all(None).await.unwrap_err();
        assert!(matches!(err, SyncError::Query { table: "units", .. }));
        assert!(err.to_string().contains("statement timeout"));
    }

    #[tokio::test]
    async fn test_create_validates_before_round_trip() {
        let (gateway, service) = setup();

        let err = service.create(json!({"callsign": "1-ADAM-12"})).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidPayload { .. }));
        assert_eq!(gateway.rows("units").len(), 1);

        let unit = service
            .create(json!({"name": "Bravo", "callsign": "1-ADAM-12"}))
            .await
            .unwrap();
        assert!(!unit.id.is_empty());
        assert!(unit.created_at.is_some());
        assert_eq!(gateway.rows("units").len(), 2);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (gateway, service) = setup();

        let unit = service.update("u1", json!({"status": "busy"})).await.unwrap();
        assert_eq!(unit.status.as_deref(), Some("busy"));

        let err = service.update("nope", json!({"status": "busy"})).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Mutation {
                op: MutationOp::Update,
                ..
            }
        ));

        service.delete("u1").await.unwrap();
        assert!(gateway.rows("units").is_empty());
    }

    #[tokio::test]
    async fn test_mutation_failure_is_mutation_error() {
        let (gateway, service) = setup();
        gateway.fail_next_mutation("permission denied");

        let err = service.delete("u1").await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Mutation {
                op: MutationOp::Delete,
                ..
            }
        ));
        assert_eq!(gateway.rows("units").len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_change_is_skipped() {
        let (gateway, service) = setup();
        let inserts = counter();
        let on_insert = bump(&inserts);
        let _handle = service.subscribe(
            SubscriberId::generate("units"),
            Callbacks::new().on_insert(move |_| on_insert()),
        );
        service.connect().await.unwrap();

        gateway.emit("units", RawChange::insert(json!({"id": "bad"})));
        gateway.emit("units", RawChange::insert(json!({"id": "u2", "name": "Bravo"})));

        eventually(|| count(&inserts) == 1).await;
        assert_eq!(service.state(), ConnectionState::Connected);
    }
}
