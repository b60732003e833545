//! Sync binding
//!
//! A `SyncBinding` is the per-consumer side of a realtime service: it
//! registers callbacks, loads a snapshot, and keeps its own
//! [`EntityCollection`] current by reconciling every change event into it.
//!
//! Events that arrive while a snapshot is in flight are applied right away
//! and also buffered; when the snapshot lands it replaces the collection and
//! the buffer is replayed over it, so nothing racing the snapshot is lost.
//! Callbacks only hold weak references to binding state, and results that
//! arrive after `deactivate` are dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::collection::EntityCollection;
use super::event::ChangeEvent;
use super::registry::{Callbacks, SubscriberId};
use super::service::{RealtimeService, Unsubscribe};
use crate::error::{SyncError, SyncResult};
use crate::models::Entity;
use crate::query::SnapshotFilter;

/// Point-in-time copy of a binding's state
#[derive(Debug, Clone)]
pub struct BindingView<E> {
    pub records: Vec<E>,
    pub is_loading: bool,
    pub error: Option<SyncError>,
    pub is_connected: bool,
    pub revision: u64,
}

struct BindingState<E> {
    collection: EntityCollection<E>,
    is_loading: bool,
    error: Option<SyncError>,
    is_connected: bool,
    active: bool,
    /// Events seen since the oldest in-flight snapshot was requested
    pending: Option<Vec<ChangeEvent<E>>>,
    fetch_seq: u64,
    /// Receivers of changes that altered the collection
    observers: Vec<mpsc::UnboundedSender<ChangeEvent<E>>>,
}

struct Shared<E> {
    state: Mutex<BindingState<E>>,
    revision: watch::Sender<u64>,
    filter: Option<SnapshotFilter>,
}

impl<E: Entity> Shared<E> {
    fn new(filter: Option<SnapshotFilter>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Mutex::new(BindingState {
                collection: EntityCollection::new(),
                is_loading: true,
                error: None,
                is_connected: false,
                active: true,
                pending: None,
                fetch_seq: 0,
                observers: Vec::new(),
            }),
            revision,
            filter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BindingState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn apply(&self, event: ChangeEvent<E>) {
        let event = match self.filter {
            Some(ref filter) => event.gated(filter),
            None => event,
        };
        let changed = {
            let mut state = self.lock();
            if !state.active {
                return;
            }
            if let Some(ref mut pending) = state.pending {
                pending.push(event.clone());
            }
            let changed = state.collection.apply(&event);
            if changed {
                state
                    .observers
                    .retain(|observer| observer.send(event.clone()).is_ok());
            }
            changed
        };
        if changed {
            self.bump();
        }
    }

    fn set_connected(&self, connected: bool, error: Option<SyncError>) {
        {
            let mut state = self.lock();
            if !state.active {
                return;
            }
            state.is_connected = connected;
            if error.is_some() {
                state.error = error;
            }
        }
        self.bump();
    }

    fn set_error(&self, error: SyncError) {
        {
            let mut state = self.lock();
            if !state.active {
                return;
            }
            state.error = Some(error);
        }
        self.bump();
    }

    fn begin_fetch(&self) -> u64 {
        let mut state = self.lock();
        state.fetch_seq += 1;
        if state.pending.is_none() {
            state.pending = Some(Vec::new());
        }
        state.fetch_seq
    }

    /// Land a snapshot result; superseded or late results are dropped
    fn finish_fetch(&self, seq: u64, result: SyncResult<Vec<E>>) {
        {
            let mut state = self.lock();
            if !state.active || state.fetch_seq != seq {
                debug!(table = E::TABLE, seq, "Discarding superseded snapshot");
                return;
            }

            let pending = state.pending.take().unwrap_or_default();
            match result {
                Ok(records) => {
                    let mut collection = EntityCollection::from_snapshot(records);
                    for event in &pending {
                        collection.apply(event);
                    }
                    debug!(
                        table = E::TABLE,
                        records = collection.len(),
                        replayed = pending.len(),
                        "Snapshot applied"
                    );
                    state.collection = collection;
                    state.error = None;
                }
                Err(e) => {
                    debug!(table = E::TABLE, "Snapshot failed: {}", e);
                    state.error = Some(e);
                }
            }
            state.is_loading = false;
        }
        self.bump();
    }
}

fn callbacks_for<E: Entity>(shared: Weak<Shared<E>>) -> Callbacks<E> {
    let on_insert = shared.clone();
    let on_update = shared.clone();
    let on_delete = shared.clone();
    let on_connected = shared.clone();
    let on_disconnected = shared.clone();
    let on_error = shared;

    Callbacks::new()
        .on_insert(move |record: &E| {
            if let Some(shared) = on_insert.upgrade() {
                shared.apply(ChangeEvent::Inserted(record.clone()));
            }
        })
        .on_update(move |record: &E| {
            if let Some(shared) = on_update.upgrade() {
                shared.apply(ChangeEvent::Updated(record.clone()));
            }
        })
        .on_delete(move |id: &str| {
            if let Some(shared) = on_delete.upgrade() {
                shared.apply(ChangeEvent::Deleted(id.to_string()));
            }
        })
        .on_connected(move || {
            if let Some(shared) = on_connected.upgrade() {
                shared.set_connected(true, None);
            }
        })
        .on_disconnected(move || {
            if let Some(shared) = on_disconnected.upgrade() {
                shared.set_connected(false, None);
            }
        })
        .on_error(move |error: &SyncError| {
            if let Some(shared) = on_error.upgrade() {
                shared.set_connected(false, Some(error.clone()));
            }
        })
}

async fn load_snapshot<E: Entity>(
    service: RealtimeService<E>,
    shared: Weak<Shared<E>>,
    seq: u64,
) {
    let filter = match shared.upgrade() {
        Some(shared) => shared.filter.clone(),
        None => return,
    };
    let result = service.get_all(filter.as_ref()).await;
    if let Some(shared) = shared.upgrade() {
        shared.finish_fetch(seq, result);
    }
}

/// Live, reconciled view of one entity table
pub struct SyncBinding<E: Entity> {
    service: RealtimeService<E>,
    shared: Arc<Shared<E>>,
    subscriber: SubscriberId,
    unsubscribe: Unsubscribe,
}

impl<E: Entity> std::fmt::Debug for SyncBinding<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBinding")
            .field("table", &E::TABLE)
            .field("subscriber", &self.subscriber)
            .field("records", &self.shared.lock().collection.len())
            .finish()
    }
}

impl<E: Entity> SyncBinding<E> {
    /// Register with `service`, open its feed and start loading a snapshot
    ///
    /// Must be called inside a tokio runtime; the connect and the snapshot
    /// run as background tasks.
    pub fn activate(service: &RealtimeService<E>, filter: Option<SnapshotFilter>) -> Self {
        let shared = Arc::new(Shared::new(filter));
        let subscriber = SubscriberId::generate(E::TABLE);
        let unsubscribe =
            service.subscribe(subscriber.clone(), callbacks_for(Arc::downgrade(&shared)));
        debug!(table = E::TABLE, subscriber = %subscriber, "Binding activated");

        tokio::spawn({
            let service = service.clone();
            async move {
                // Failures reach the binding through on_error
                service.connect().await.ok();
            }
        });

        let seq = shared.begin_fetch();
        tokio::spawn(load_snapshot(
            service.clone(),
            Arc::downgrade(&shared),
            seq,
        ));

        Self {
            service: service.clone(),
            shared,
            subscriber,
            unsubscribe,
        }
    }

    pub fn service(&self) -> &RealtimeService<E> {
        &self.service
    }

    pub fn subscriber_id(&self) -> &SubscriberId {
        &self.subscriber
    }

    pub fn filter(&self) -> Option<&SnapshotFilter> {
        self.shared.filter.as_ref()
    }

    pub fn view(&self) -> BindingView<E> {
        let state = self.shared.lock();
        BindingView {
            records: state.collection.records().to_vec(),
            is_loading: state.is_loading,
            error: state.error.clone(),
            is_connected: state.is_connected,
            revision: *self.shared.revision.borrow(),
        }
    }

    pub fn records(&self) -> Vec<E> {
        self.shared.lock().collection.records().to_vec()
    }

    pub fn get(&self, id: &str) -> Option<E> {
        self.shared.lock().collection.get(id).cloned()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.lock().is_loading
    }

    pub fn error(&self) -> Option<SyncError> {
        self.shared.lock().error.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().is_connected
    }

    pub fn is_active(&self) -> bool {
        self.shared.lock().active
    }

    /// Counter bumped on every visible state change
    pub fn revision(&self) -> u64 {
        *self.shared.revision.borrow()
    }

    /// Receiver notified on every revision bump
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Stream of changes that altered the collection, already gated by
    /// the filter
    ///
    /// Changes replayed over a snapshot are not repeated here; the stream
    /// ends when the binding is deactivated.
    pub fn changes(&self) -> mpsc::UnboundedReceiver<ChangeEvent<E>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.lock();
        if state.active {
            state.observers.push(tx);
        }
        rx
    }

    /// Wait until `predicate` holds for the current state
    pub async fn wait_until(&self, mut predicate: impl FnMut(&BindingView<E>) -> bool) {
        let mut revisions = self.shared.revision.subscribe();
        loop {
            if predicate(&self.view()) {
                return;
            }
            if revisions.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fetch a fresh snapshot without touching the subscription
    pub async fn refresh(&self) -> SyncResult<()> {
        let seq = self.shared.begin_fetch();
        let result = self.service.get_all(self.shared.filter.as_ref()).await;
        let outcome = match result {
            Ok(_) => Ok(()),
            Err(ref e) => Err(e.clone()),
        };
        self.shared.finish_fetch(seq, result);
        outcome
    }

    /// Create a record and reconcile the stored row
    pub async fn create(&self, data: Value) -> SyncResult<E> {
        let result = self.service.create(data).await;
        self.settle_record(result)
    }

    /// Patch a record and reconcile the stored row
    pub async fn update(&self, id: &str, patch: Value) -> SyncResult<E> {
        let result = self.service.update(id, patch).await;
        self.settle_record(result)
    }

    pub async fn delete(&self, id: &str) -> SyncResult<()> {
        match self.service.delete(id).await {
            Ok(()) => {
                self.shared.apply(ChangeEvent::Deleted(id.to_string()));
                Ok(())
            }
            Err(e) => {
                self.shared.set_error(e.clone());
                Err(e)
            }
        }
    }

    fn settle_record(&self, result: SyncResult<E>) -> SyncResult<E> {
        match result {
            Ok(record) => {
                self.shared.apply(ChangeEvent::Updated(record.clone()));
                Ok(record)
            }
            Err(e) => {
                self.shared.set_error(e.clone());
                Err(e)
            }
        }
    }

    /// Deregister from the service; the shared feed stays open
    pub fn deactivate(&self) {
        {
            let mut state = self.shared.lock();
            if !state.active {
                return;
            }
            state.active = false;
            state.pending = None;
            state.observers.clear();
        }
        self.unsubscribe.unsubscribe();
        debug!(table = E::TABLE, subscriber = %self.subscriber, "Binding deactivated");
    }
}

impl<E: Entity> Drop for SyncBinding<E> {
    fn drop(&mut self) {
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Gateway, MemoryGateway, RawChange};
    use crate::models::Unit;
    use crate::sync::service::ConnectionState;
    use serde_json::json;
    use std::time::Duration;

    fn gateway() -> Arc<MemoryGateway> {
        Arc::new(MemoryGateway::new().with_rows(
            "units",
            vec![json!({
                "id": "u1",
                "name": "Alpha",
                "agency": "lspd",
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-01-01T00:00:00Z"
            })],
        ))
    }

    fn service(gateway: &Arc<MemoryGateway>) -> RealtimeService<Unit> {
        RealtimeService::new(gateway.clone())
    }

    async fn settle<E: Entity>(
        binding: &SyncBinding<E>,
        predicate: impl FnMut(&BindingView<E>) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(2), binding.wait_until(predicate))
            .await
            .expect("binding did not reach expected state");
    }

    async fn ready<E: Entity>(binding: &SyncBinding<E>) {
        settle(binding, |v| !v.is_loading && v.is_connected).await;
    }

    async fn next_change(changes: &mut mpsc::UnboundedReceiver<ChangeEvent<Unit>>) -> ChangeEvent<Unit> {
        tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .expect("no change received")
            .expect("change stream closed")
    }

    fn names(view: &BindingView<Unit>) -> Vec<String> {
        view.records.iter().map(|u| u.name.clone()).collect()
    }

    #[tokio::test]
    async fn test_activation_loads_snapshot() {
        let gateway = gateway();
        let binding = SyncBinding::activate(&service(&gateway), None);
        assert!(binding.is_loading());

        ready(&binding).await;

        assert_eq!(binding.records().len(), 1);
        assert!(binding.error().is_none());
        assert!(binding.revision() > 0);
    }

    #[tokio::test]
    async fn test_units_scenario() {
        let gateway = gateway();
        let binding = SyncBinding::activate(&service(&gateway), None);
        ready(&binding).await;

        gateway.emit("units", RawChange::insert(json!({"id": "u2", "name": "Bravo"})));
        settle(&binding, |v| names(v) == ["Bravo", "Alpha"]).await;

        gateway.emit("units", RawChange::update(json!({"id": "u1", "name": "Alpha-2"})));
        settle(&binding, |v| names(v) == ["Bravo", "Alpha-2"]).await;

        gateway.emit("units", RawChange::delete("u2"));
        settle(&binding, |v| names(v) == ["Alpha-2"]).await;
    }

    #[tokio::test]
    async fn test_direct_response_and_echo_leave_one_record() {
        let gateway = gateway();
        let binding = SyncBinding::activate(&service(&gateway), None);
        ready(&binding).await;

        let created = binding.create(json!({"name": "Bravo"})).await.unwrap();
        assert!(binding.get(&created.id).is_some());

        // Echo from the feed plus a duplicate delivery
        gateway.emit(
            "units",
            RawChange::insert(serde_json::to_value(&created).unwrap()),
        );
        let id = created.id.clone();
        settle(&binding, |v| v.records.iter().any(|u| u.id == id)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let matching = binding
            .records()
            .iter()
            .filter(|u| u.id == created.id)
            .count();
        assert_eq!(matching, 1);
        assert_eq!(binding.records().len(), 2);
    }

    #[tokio::test]
    async fn test_late_older_echo_does_not_roll_back() {
        let gateway = gateway();
        let binding = SyncBinding::activate(&service(&gateway), None);
        ready(&binding).await;

        let updated = binding
            .update("u1", json!({"status": "busy"}))
            .await
            .unwrap();
        assert_eq!(binding.get("u1").unwrap().status.as_deref(), Some("busy"));

        gateway.emit(
            "units",
            RawChange::update(json!({
                "id": "u1",
                "name": "Alpha",
                "status": "available",
                "updated_at": "2024-01-01T00:00:00Z"
            })),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let current = binding.get("u1").unwrap();
        assert_eq!(current.status.as_deref(), Some("busy"));
        assert_eq!(current.updated_at, updated.updated_at);
    }

    #[tokio::test]
    async fn test_two_bindings_share_one_channel() {
        let gateway = gateway();
        let service = service(&gateway);
        let first = SyncBinding::activate(&service, None);
        let second = SyncBinding::activate(&service, None);
        ready(&first).await;
        ready(&second).await;

        assert_eq!(gateway.channel_opens("units"), 1);
        assert_eq!(service.subscriber_count(), 2);

        gateway
            .insert("units", json!({"name": "Bravo"}))
            .await
            .unwrap();
        settle(&first, |v| v.records.len() == 2).await;
        settle(&second, |v| v.records.len() == 2).await;
    }

    #[tokio::test]
    async fn test_snapshot_failure_keeps_subscription() {
        let gateway = gateway();
        gateway.fail_next_query("relation does not exist");
        let binding = SyncBinding::activate(&service(&gateway), None);

        ready(&binding).await;
        let view = binding.view();
        assert!(matches!(view.error, Some(SyncError::Query { .. })));
        assert!(view.records.is_empty());

        gateway
            .insert("units", json!({"name": "Bravo"}))
            .await
            .unwrap();
        settle(&binding, |v| names(v) == ["Bravo"]).await;
        assert!(binding.error().is_some());

        binding.refresh().await.unwrap();
        assert!(binding.error().is_none());
        assert_eq!(names(&binding.view()), ["Bravo", "Alpha"]);
    }

    #[tokio::test]
    async fn test_event_racing_snapshot_is_replayed() {
        let gateway = gateway();
        gateway.set_query_delay(Some(Duration::from_millis(200)));
        let binding = SyncBinding::activate(&service(&gateway), None);

        settle(&binding, |v| v.is_connected).await;
        assert!(binding.is_loading());
        gateway.emit("units", RawChange::insert(json!({"id": "u2", "name": "Bravo"})));
        gateway.emit("units", RawChange::delete("u1"));

        settle(&binding, |v| !v.is_loading).await;
        assert_eq!(names(&binding.view()), ["Bravo"]);
    }

    #[tokio::test]
    async fn test_filtered_binding_gates_pushed_records() {
        let gateway = gateway();
        let binding = SyncBinding::activate(&service(&gateway), Some(SnapshotFilter::agency("lspd")));
        ready(&binding).await;

        gateway.emit(
            "units",
            RawChange::insert(json!({"id": "f1", "name": "Engine 1", "agency": "lsfd"})),
        );
        gateway.emit(
            "units",
            RawChange::insert(json!({"id": "u2", "name": "Bravo", "agency": "lspd"})),
        );
        settle(&binding, |v| v.records.len() == 2).await;
        assert!(binding.get("f1").is_none());

        // Moving a unit to another agency removes it from this view
        gateway.emit(
            "units",
            RawChange::update(json!({"id": "u1", "name": "Alpha", "agency": "lsfd"})),
        );
        settle(&binding, |v| names(v) == ["Bravo"]).await;
    }

    #[tokio::test]
    async fn test_deactivate_leaves_feed_open() {
        let gateway = gateway();
        let service = service(&gateway);
        let binding = SyncBinding::activate(&service, None);
        ready(&binding).await;

        binding.deactivate();
        binding.deactivate();
        assert_eq!(service.subscriber_count(), 0);
        assert_eq!(service.state(), ConnectionState::Connected);

        gateway.emit("units", RawChange::insert(json!({"id": "u2", "name": "Bravo"})));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(binding.records().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_after_teardown_is_discarded() {
        let gateway = gateway();
        gateway.set_query_delay(Some(Duration::from_millis(50)));
        let binding = SyncBinding::activate(&service(&gateway), None);

        binding.deactivate();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(binding.records().is_empty());
        assert!(binding.is_loading());
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let gateway = gateway();
        let service = service(&gateway);
        {
            let binding = SyncBinding::activate(&service, None);
            ready(&binding).await;
            assert_eq!(service.subscriber_count(), 1);
        }
        assert_eq!(service.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_records() {
        let gateway = gateway();
        let binding = SyncBinding::activate(&service(&gateway), None);
        ready(&binding).await;

        gateway.fail_next_mutation("permission denied");
        let err = binding.delete("u1").await.unwrap_err();

        assert!(matches!(err, SyncError::Mutation { .. }));
        assert_eq!(binding.records().len(), 1);
        assert!(binding.error().is_some());

        let err = binding.create(json!({"status": "busy"})).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidPayload { .. }));
        assert_eq!(binding.records().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_clears_connected_flag() {
        let gateway = gateway();
        let service = service(&gateway);
        let binding = SyncBinding::activate(&service, None);
        ready(&binding).await;

        service.disconnect();
        assert!(!binding.is_connected());
        assert!(binding.error().is_none());

        service.connect().await.unwrap();
        settle(&binding, |v| v.is_connected).await;
    }

    #[tokio::test]
    async fn test_changes_follow_reconciled_state() {
        let gateway = gateway();
        let binding = SyncBinding::activate(&service(&gateway), Some(SnapshotFilter::agency("lspd")));
        ready(&binding).await;
        let mut changes = binding.changes();

        binding
            .update("u1", json!({"status": "busy"}))
            .await
            .unwrap();

        // Older echo and a foreign insert leave the view untouched
        gateway.emit(
            "units",
            RawChange::update(json!({
                "id": "u1",
                "name": "Alpha",
                "agency": "lspd",
                "status": "available",
                "updated_at": "2024-01-01T00:00:00Z"
            })),
        );
        gateway.emit(
            "units",
            RawChange::insert(json!({"id": "f1", "name": "Engine 1", "agency": "lsfd"})),
        );
        gateway.emit(
            "units",
            RawChange::insert(json!({"id": "u2", "name": "Bravo", "agency": "lspd"})),
        );

        let mut seen = Vec::new();
        loop {
            let change = next_change(&mut changes).await;
            let done = change.id() == "u2";
            seen.push(change);
            if done {
                break;
            }
        }
        assert!(matches!(seen[0], ChangeEvent::Updated(_)));
        for change in &seen {
            match change {
                ChangeEvent::Updated(unit) => assert_eq!(unit.status.as_deref(), Some("busy")),
                ChangeEvent::Inserted(unit) => assert_eq!(unit.id, "u2"),
                ChangeEvent::Deleted(id) => panic!("Unexpected removal of {}", id),
            }
        }

        binding.deactivate();
        assert!(changes.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_error_reaches_binding() {
        let gateway = gateway();
        let binding = SyncBinding::activate(&service(&gateway), None);
        ready(&binding).await;

        gateway.fail_channel("units", "socket reset");
        settle(&binding, |v| !v.is_connected).await;

        assert!(matches!(binding.error(), Some(SyncError::Channel { .. })));
    }
}
