//! Config command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};

use mdt_core::Config;

use super::load_config;
use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config = load_config(config_path)?;
    let api_key = config.api_key.as_deref().map(mask_secret);

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "gateway_url": config.gateway_url,
                    "realtime_url": config.realtime_endpoint(),
                    "api_key": api_key,
                    "agency": config.agency,
                    "request_timeout_secs": config.request_timeout_secs,
                    "heartbeat_secs": config.heartbeat_secs,
                    "auto_disconnect": config.auto_disconnect,
                    "reconnect": config.reconnect,
                    "log_level": config.log_level
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.gateway_url.as_deref().unwrap_or(""));
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            let not_set = "(not set)";
            println!("Configuration:");
            println!(
                "  gateway_url:          {}",
                config.gateway_url.as_deref().unwrap_or(not_set)
            );
            println!(
                "  realtime_url:         {}",
                config.realtime_endpoint().as_deref().unwrap_or(not_set)
            );
            println!(
                "  api_key:              {}",
                api_key.as_deref().unwrap_or(not_set)
            );
            println!(
                "  agency:               {}",
                config.agency.as_deref().unwrap_or("(all)")
            );
            println!("  request_timeout_secs: {}", config.request_timeout_secs);
            println!("  heartbeat_secs:       {}", config.heartbeat_secs);
            println!("  auto_disconnect:      {}", config.auto_disconnect);
            println!(
                "  reconnect:            {} (initial {} ms, max {} ms)",
                if config.reconnect.enabled { "on" } else { "off" },
                config.reconnect.initial_delay_ms,
                config.reconnect.max_delay_ms
            );
            println!("  log_level:            {}", config.log_level);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: &str, value: &str, config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.set(key, value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "api_key" {
        mask_secret(value)
    } else {
        value.to_string()
    };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}

/// Keep only the last four characters of a secret
fn mask_secret(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= 4 {
        return "****".to_string();
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("****{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("abc"), "****");
        assert_eq!(mask_secret("eyJhbGciOiJIUzI1NiJ9.abcd"), "****abcd");
    }

    #[test]
    fn test_set_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        set("agency", "lsfd", Some(&path), &output).unwrap();
        set("reconnect.enabled", "true", Some(&path), &output).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("lsfd"));
        assert!(content.contains("[reconnect]"));

        assert!(set("colour", "red", Some(&path), &output).is_err());
        show(Some(&path), &output).unwrap();
    }
}
