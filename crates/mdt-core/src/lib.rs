//! MDT Core Library
//!
//! Realtime data synchronization for the MDT dashboard: every entity table
//! (citizens, vehicles, units, warrants, ...) is kept current in any number
//! of local views over a single shared change feed per table.
//!
//! # Architecture
//!
//! - **Gateway**: the hosted database, consumed through the [`Gateway`]
//!   trait (snapshot query, mutations, per-table change feed)
//! - **RealtimeService**: one per entity type, owns the feed and fans
//!   changes out to registered subscribers
//! - **SyncBinding**: one per consumer, loads a snapshot and reconciles
//!   every pushed change into its own ordered collection
//! - **RealtimeHub**: hands out the shared service for each entity type
//!
//! # Quick Start
//!
//! ```text
//! let gateway = Arc::new(RemoteGateway::from_config(&config)?);
//! let hub = RealtimeHub::new(gateway, config.service_options());
//!
//! let units = hub.bind::<Unit>(config.agency_filter());
//! units.wait_until(|view| !view.is_loading).await;
//! for unit in units.records() {
//!     println!("{}", unit.label());
//! }
//! ```
//!
//! # Modules
//!
//! - `sync`: realtime services, subscriptions and bindings
//! - `gateway`: gateway contract, in-memory and hosted implementations
//! - `models`: entity records and payload validation
//! - `query`: snapshot filters and ordering
//! - `hub`: shared service registry
//! - `config`: Application configuration
//! - `error`: error types

pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod models;
pub mod query;
pub mod sync;

pub use config::Config;
pub use error::{GatewayError, MutationOp, SyncError, SyncResult};
pub use gateway::{Gateway, MemoryGateway, RemoteGateway};
pub use hub::RealtimeHub;
pub use models::{
    Certificate, Citizen, Division, Entity, Equipment, Firearm, MedicalRecord,
    PropertyTransaction, Summons, Unit, Vehicle, Warrant,
};
pub use query::SnapshotFilter;
pub use sync::{
    BindingView, Callbacks, ChangeEvent, ConnectionState, EntityCollection, RealtimeService,
    ReconnectPolicy, ServiceOptions, SubscriberId, SyncBinding, Unsubscribe,
};
