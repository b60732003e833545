//! Shared service registry
//!
//! `RealtimeHub` hands out one [`RealtimeService`] per entity type, so every
//! consumer of the same table shares one change feed. Services are created
//! lazily on first request.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::gateway::Gateway;
use crate::models::Entity;
use crate::query::SnapshotFilter;
use crate::sync::{ConnectionState, RealtimeService, ServiceOptions, SyncBinding};

/// Type-erased view of a service held by the hub
trait AnyService: Send + Sync {
    fn table(&self) -> &'static str;
    fn state(&self) -> ConnectionState;
    fn disconnect(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<E: Entity> AnyService for RealtimeService<E> {
    fn table(&self) -> &'static str {
        E::TABLE
    }

    fn state(&self) -> ConnectionState {
        RealtimeService::state(self)
    }

    fn disconnect(&self) {
        RealtimeService::disconnect(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Process-wide registry of realtime services keyed by entity type
pub struct RealtimeHub {
    gateway: Arc<dyn Gateway>,
    options: ServiceOptions,
    services: Mutex<HashMap<TypeId, Arc<dyn AnyService>>>,
}

impl std::fmt::Debug for RealtimeHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeHub")
            .field("options", &self.options)
            .field("tables", &self.tables())
            .finish()
    }
}

impl RealtimeHub {
    pub fn new(gateway: Arc<dyn Gateway>, options: ServiceOptions) -> Self {
        Self {
            gateway,
            options,
            services: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TypeId, Arc<dyn AnyService>>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    /// The shared service for `E`
    pub fn service<E: Entity>(&self) -> RealtimeService<E> {
        let mut services = self.lock();
        let entry = services.entry(TypeId::of::<E>()).or_insert_with(|| {
            debug!(table = E::TABLE, "Creating realtime service");
            Arc::new(RealtimeService::<E>::with_options(
                Arc::clone(&self.gateway),
                self.options,
            ))
        });

        match entry.as_any().downcast_ref::<RealtimeService<E>>() {
            Some(service) => service.clone(),
            // Keys are the entity's own TypeId, so this arm is unreachable
            None => RealtimeService::with_options(Arc::clone(&self.gateway), self.options),
        }
    }

    /// Activate a binding on the shared service for `E`
    pub fn bind<E: Entity>(&self, filter: Option<SnapshotFilter>) -> SyncBinding<E> {
        SyncBinding::activate(&self.service::<E>(), filter)
    }

    /// Tables with a service, sorted
    pub fn tables(&self) -> Vec<&'static str> {
        let mut tables: Vec<_> = self.lock().values().map(|s| s.table()).collect();
        tables.sort_unstable();
        tables
    }

    /// Tables whose feed is currently connected
    pub fn connected_tables(&self) -> Vec<&'static str> {
        let mut tables: Vec<_> = self
            .lock()
            .values()
            .filter(|s| s.state() == ConnectionState::Connected)
            .map(|s| s.table())
            .collect();
        tables.sort_unstable();
        tables
    }

    /// Close every feed; services and their subscribers stay registered
    pub fn disconnect_all(&self) {
        // Subscribers hear about the teardown, so run it outside the lock
        let services: Vec<_> = self.lock().values().cloned().collect();
        for service in &services {
            service.disconnect();
        }
        debug!(services = services.len(), "Disconnected all change feeds");
    }
}
