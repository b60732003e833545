//! List command handler

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use mdt_core::{Entity, Gateway, RealtimeService, SnapshotFilter};

use super::{for_entity, EntityKind};
use crate::output::Output;

/// Print a one-shot snapshot of an entity table
pub async fn run(
    kind: EntityKind,
    gateway: Arc<dyn Gateway>,
    filter: Option<SnapshotFilter>,
    output: &Output,
) -> Result<()> {
    for_entity!(kind, list(gateway, filter, output))
}

async fn list<E: Entity>(
    gateway: Arc<dyn Gateway>,
    filter: Option<SnapshotFilter>,
    output: &Output,
) -> Result<()> {
    debug!(table = E::TABLE, ?filter, "Listing");
    let service = RealtimeService::<E>::new(gateway);
    let records = service
        .get_all(filter.as_ref())
        .await
        .with_context(|| format!("Failed to list {}", E::TABLE))?;

    output.print_records(&records)
}
