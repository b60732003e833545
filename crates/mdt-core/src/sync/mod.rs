//! Realtime synchronization
//!
//! - [`RealtimeService`]: one shared change feed per entity table, fanned out
//!   to registered subscribers
//! - [`SubscriptionRegistry`]: subscriber id to callback set bookkeeping
//! - [`SyncBinding`]: per-consumer snapshot plus reconciled live updates
//! - [`EntityCollection`]: the id-unique ordered list a binding maintains

mod binding;
mod collection;
mod event;
mod registry;
mod service;

pub use binding::{BindingView, SyncBinding};
pub use collection::EntityCollection;
pub use event::ChangeEvent;
pub use registry::{Callbacks, SubscriberId, SubscriptionRegistry};
pub use service::{ConnectionState, RealtimeService, ReconnectPolicy, ServiceOptions, Unsubscribe};
