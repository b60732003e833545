//! MDT CLI
//!
//! Command-line interface for MDT: inspect and watch entity tables on a
//! hosted gateway.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mdt_core::RealtimeHub;

mod commands;
mod output;

use commands::EntityKind;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "mdt")]
#[command(about = "MDT - realtime records for agency dashboards")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides MDT_LOG_LEVEL
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current rows of a table
    #[command(alias = "ls")]
    List {
        /// Entity table
        #[arg(value_enum)]
        entity: EntityKind,
        /// Only rows owned by this agency (defaults to the configured agency)
        #[arg(short, long)]
        agency: Option<String>,
        /// Ignore the configured agency
        #[arg(long, conflicts_with = "agency")]
        all: bool,
    },
    /// Stream changes to a table until Ctrl-C
    Watch {
        /// Entity table
        #[arg(value_enum)]
        entity: EntityKind,
        /// Only rows owned by this agency (defaults to the configured agency)
        #[arg(short, long)]
        agency: Option<String>,
        /// Ignore the configured agency
        #[arg(long, conflicts_with = "agency")]
        all: bool,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (gateway_url, api_key, agency, reconnect.enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

/// Route core and CLI logs to stderr at `level`
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(format!("mdt_core={level},mdt_cli={level}"))
        .unwrap_or_else(|_| EnvFilter::new("mdt_core=warn,mdt_cli=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work without a reachable gateway
    if let Commands::Config { command } = &cli.command {
        return match command.clone().unwrap_or(ConfigCommands::Show) {
            ConfigCommands::Show => commands::config::show(config_path, &output),
            ConfigCommands::Set { key, value } => {
                commands::config::set(&key, &value, config_path, &output)
            }
        };
    }

    let config = commands::load_config(config_path)?;
    init_tracing(cli.log_level.as_deref().unwrap_or(&config.log_level));
    let gateway = commands::connect_gateway(&config)?;

    match cli.command {
        Commands::List {
            entity,
            agency,
            all,
        } => {
            let filter = commands::resolve_filter(agency, all, &config);
            commands::list::run(entity, gateway, filter, &output).await
        }
        Commands::Watch {
            entity,
            agency,
            all,
        } => {
            let filter = commands::resolve_filter(agency, all, &config);
            let hub = RealtimeHub::new(gateway, config.service_options());
            let result = commands::watch::run(entity, &hub, filter, &output).await;
            hub.disconnect_all();
            result
        }
        Commands::Config { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_watch() {
        let cli = Cli::parse_from(["mdt", "--json", "watch", "units", "--agency", "lspd"]);
        assert!(cli.json);
        match cli.command {
            Commands::Watch { entity, agency, all } => {
                assert_eq!(entity, EntityKind::Units);
                assert_eq!(agency.as_deref(), Some("lspd"));
                assert!(!all);
            }
            _ => panic!("Expected watch command"),
        }
    }

    #[test]
    fn test_parse_list_all() {
        let cli = Cli::parse_from(["mdt", "ls", "medical-records", "--all", "--log-level", "debug"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(
            cli.command,
            Commands::List {
                entity: EntityKind::MedicalRecords,
                all: true,
                ..
            }
        ));
    }
}
