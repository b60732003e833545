//! Command handlers

pub mod config;
pub mod list;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ValueEnum;

use mdt_core::{Config, Gateway, RemoteGateway, SnapshotFilter};

/// Entity tables the CLI can read
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EntityKind {
    Citizens,
    Vehicles,
    Units,
    Divisions,
    Equipment,
    Warrants,
    Summons,
    Certificates,
    #[value(alias = "gun-registry")]
    Firearms,
    MedicalRecords,
    PropertyTransactions,
}

/// Run a generic async handler for the entity type behind an `EntityKind`
macro_rules! for_entity {
    ($kind:expr, $handler:ident ( $($arg:expr),* $(,)? )) => {{
        use $crate::commands::EntityKind;
        match $kind {
            EntityKind::Citizens => $handler::<mdt_core::Citizen>($($arg),*).await,
            EntityKind::Vehicles => $handler::<mdt_core::Vehicle>($($arg),*).await,
            EntityKind::Units => $handler::<mdt_core::Unit>($($arg),*).await,
            EntityKind::Divisions => $handler::<mdt_core::Division>($($arg),*).await,
            EntityKind::Equipment => $handler::<mdt_core::Equipment>($($arg),*).await,
            EntityKind::Warrants => $handler::<mdt_core::Warrant>($($arg),*).await,
            EntityKind::Summons => $handler::<mdt_core::Summons>($($arg),*).await,
            EntityKind::Certificates => $handler::<mdt_core::Certificate>($($arg),*).await,
            EntityKind::Firearms => $handler::<mdt_core::Firearm>($($arg),*).await,
            EntityKind::MedicalRecords => $handler::<mdt_core::MedicalRecord>($($arg),*).await,
            EntityKind::PropertyTransactions => {
                $handler::<mdt_core::PropertyTransaction>($($arg),*).await
            }
        }
    }};
}

pub(crate) use for_entity;

/// Load configuration, honouring `--config`
pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config> {
    Config::load_with_cli_override(config_path).context("Failed to load configuration")
}

/// Gateway for the configured hosted project
pub fn connect_gateway(config: &Config) -> Result<Arc<dyn Gateway>> {
    let gateway = RemoteGateway::from_config(config)
        .context("Cannot reach the gateway. Run 'mdt config set gateway_url <url>' and 'mdt config set api_key <key>'.")?;
    Ok(Arc::new(gateway))
}

/// Snapshot filter from `--agency`, `--all` and the configured default
pub fn resolve_filter(agency: Option<String>, all: bool, config: &Config) -> Option<SnapshotFilter> {
    if all {
        return None;
    }
    agency
        .map(SnapshotFilter::agency)
        .or_else(|| config.agency_filter())
}
