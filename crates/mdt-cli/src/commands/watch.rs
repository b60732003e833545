//! Watch command handler
//!
//! Binds to one entity table and streams reconciled changes until Ctrl-C.

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tracing::info;

use mdt_core::{Callbacks, Entity, RealtimeHub, SnapshotFilter, SubscriberId, SyncError};

use super::{for_entity, EntityKind};
use crate::output::Output;

/// Feed status forwarded to the printing loop
#[derive(Debug)]
enum FeedStatus {
    Connected,
    Disconnected,
    Error(SyncError),
}

pub async fn run(
    kind: EntityKind,
    hub: &RealtimeHub,
    filter: Option<SnapshotFilter>,
    output: &Output,
) -> Result<()> {
    for_entity!(kind, watch(hub, filter, output))
}

fn forward<E: Entity>(tx: mpsc::UnboundedSender<FeedStatus>) -> Callbacks<E> {
    let on_connected = tx.clone();
    let on_disconnected = tx.clone();
    let on_error = tx;

    // Send failures mean the printing loop is gone
    Callbacks::new()
        .on_connected(move || {
            on_connected.send(FeedStatus::Connected).ok();
        })
        .on_disconnected(move || {
            on_disconnected.send(FeedStatus::Disconnected).ok();
        })
        .on_error(move |error: &SyncError| {
            on_error.send(FeedStatus::Error(error.clone())).ok();
        })
}

async fn watch<E: Entity>(
    hub: &RealtimeHub,
    filter: Option<SnapshotFilter>,
    output: &Output,
) -> Result<()> {
    let binding = hub.bind::<E>(filter);
    let mut changes = binding.changes();
    let (tx, mut statuses) = mpsc::unbounded_channel();
    let feed = binding
        .service()
        .subscribe(SubscriberId::generate(E::TABLE), forward::<E>(tx));
    let retrying = binding.service().options().reconnect.is_some();

    tokio::select! {
        _ = binding.wait_until(|view| !view.is_loading) => {}
        _ = tokio::signal::ctrl_c() => {
            feed.unsubscribe();
            return Ok(());
        }
    }

    // The snapshot already includes whatever arrived while it loaded
    while changes.try_recv().is_ok() {}
    let view = binding.view();
    match view.error {
        Some(ref e) => output.status("error", Some(&e.to_string())),
        None => output.print_records(&view.records)?,
    }
    info!(table = E::TABLE, records = view.records.len(), "Watching");

    let result = loop {
        tokio::select! {
            change = changes.recv() => match change {
                Some(change) => output.print_change(&change, binding.records().len())?,
                None => break Ok(()),
            },
            status = statuses.recv() => match status {
                Some(FeedStatus::Connected) => output.status("connected", Some(E::TABLE)),
                Some(FeedStatus::Disconnected) => output.status("disconnected", Some(E::TABLE)),
                Some(FeedStatus::Error(e)) => {
                    output.status("error", Some(&e.to_string()));
                    if !retrying {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    feed.unsubscribe();
    binding.deactivate();

    if let Err(e) = result {
        match e.recovery_suggestion() {
            Some(hint) => bail!("{}\n{}", e, hint),
            None => bail!("{}", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdt_core::{ChangeEvent, MemoryGateway, ServiceOptions, Unit};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_forward_relays_feed_status() {
        let gateway = Arc::new(MemoryGateway::new());
        let hub = RealtimeHub::new(gateway.clone(), ServiceOptions::default());
        let service = hub.service::<Unit>();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = service.subscribe(SubscriberId::generate("units"), forward::<Unit>(tx));
        service.connect().await.unwrap();
        assert!(matches!(rx.recv().await, Some(FeedStatus::Connected)));

        hub.disconnect_all();
        assert!(matches!(rx.recv().await, Some(FeedStatus::Disconnected)));
        feed.unsubscribe();
    }

    #[tokio::test]
    async fn test_binding_changes_drop_foreign_records() {
        let gateway = Arc::new(MemoryGateway::new());
        let hub = RealtimeHub::new(gateway.clone(), ServiceOptions::default());
        let binding = hub.bind::<Unit>(Some(SnapshotFilter::agency("lspd")));
        let mut changes = binding.changes();
        tokio::time::timeout(
            Duration::from_secs(2),
            binding.wait_until(|v| !v.is_loading && v.is_connected),
        )
        .await
        .unwrap();

        let service = binding.service();
        service
            .create(json!({"name": "Engine 1", "agency": "lsfd"}))
            .await
            .unwrap();
        service
            .create(json!({"name": "Bravo", "agency": "lspd"}))
            .await
            .unwrap();

        let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .unwrap();
        match change {
            Some(ChangeEvent::Inserted(unit)) => assert_eq!(unit.name, "Bravo"),
            other => panic!("Expected insert, got {:?}", other),
        }
    }
}
