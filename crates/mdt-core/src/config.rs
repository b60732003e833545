//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/mdt/config.toml)
//! 3. Environment variables (MDT_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::query::SnapshotFilter;
use crate::sync::{ReconnectPolicy, ServiceOptions};

/// Environment variable prefix
const ENV_PREFIX: &str = "MDT";

/// Keys accepted by [`Config::set`]
pub const SETTABLE_KEYS: &[&str] = &[
    "gateway_url",
    "realtime_url",
    "api_key",
    "agency",
    "request_timeout_secs",
    "heartbeat_secs",
    "auto_disconnect",
    "reconnect.enabled",
    "reconnect.initial_delay_ms",
    "reconnect.max_delay_ms",
    "log_level",
];

/// Change feed retry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Hosted project URL (https://<project>.example.co)
    #[serde(default)]
    pub gateway_url: Option<String>,

    /// Realtime endpoint; derived from `gateway_url` when unset
    #[serde(default)]
    pub realtime_url: Option<String>,

    /// Project API key
    #[serde(default)]
    pub api_key: Option<String>,

    /// Default agency filter for snapshots
    #[serde(default)]
    pub agency: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Realtime heartbeat interval
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Close a change feed once its last subscriber leaves
    #[serde(default)]
    pub auto_disconnect: bool,

    /// Tracing filter level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_url: None,
            realtime_url: None,
            api_key: None,
            agency: None,
            request_timeout_secs: default_request_timeout_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            auto_disconnect: false,
            log_level: default_log_level(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (MDT_GATEWAY_URL, MDT_API_KEY, ...)
    /// 2. Config file (~/.config/mdt/config.toml or MDT_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load using an explicit path when given (the CLI `--config` flag)
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        let var = |name: &str| std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok();
        let optional = |val: String| if val.is_empty() { None } else { Some(val) };

        if let Some(val) = var("GATEWAY_URL") {
            self.gateway_url = optional(val);
        }

        if let Some(val) = var("REALTIME_URL") {
            self.realtime_url = optional(val);
        }

        if let Some(val) = var("API_KEY") {
            self.api_key = optional(val);
        }

        if let Some(val) = var("AGENCY") {
            self.agency = optional(val);
        }

        if let Some(val) = var("AUTO_DISCONNECT") {
            self.auto_disconnect = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Some(val) = var("LOG_LEVEL") {
            if !val.is_empty() {
                self.log_level = val;
            }
        }
    }

    /// Set a value by key, as used by `mdt config set`
    ///
    /// Empty strings and `none` clear optional values.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = || {
            if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.to_string())
            }
        };

        match key {
            "gateway_url" => self.gateway_url = optional(),
            "realtime_url" => self.realtime_url = optional(),
            "api_key" => self.api_key = optional(),
            "agency" => self.agency = optional(),
            "request_timeout_secs" => {
                self.request_timeout_secs = value
                    .parse()
                    .context("Invalid value for request_timeout_secs. Use whole seconds.")?;
            }
            "heartbeat_secs" => {
                self.heartbeat_secs = value
                    .parse()
                    .context("Invalid value for heartbeat_secs. Use whole seconds.")?;
            }
            "auto_disconnect" => {
                self.auto_disconnect = value
                    .parse()
                    .context("Invalid value for auto_disconnect. Use 'true' or 'false'.")?;
            }
            "reconnect.enabled" => {
                self.reconnect.enabled = value
                    .parse()
                    .context("Invalid value for reconnect.enabled. Use 'true' or 'false'.")?;
            }
            "reconnect.initial_delay_ms" => {
                self.reconnect.initial_delay_ms = value
                    .parse()
                    .context("Invalid value for reconnect.initial_delay_ms. Use milliseconds.")?;
            }
            "reconnect.max_delay_ms" => {
                self.reconnect.max_delay_ms = value
                    .parse()
                    .context("Invalid value for reconnect.max_delay_ms. Use milliseconds.")?;
            }
            "log_level" => self.log_level = value.to_string(),
            _ => {
                bail!(
                    "Unknown configuration key: '{}'\nValid keys: {}",
                    key,
                    SETTABLE_KEYS.join(", ")
                );
            }
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with MDT_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mdt")
            .join("config.toml")
    }

    /// Websocket base for the realtime endpoint
    ///
    /// Uses `realtime_url` when set, otherwise swaps the scheme of
    /// `gateway_url` (https to wss, http to ws).
    pub fn realtime_endpoint(&self) -> Option<String> {
        if let Some(ref url) = self.realtime_url {
            return Some(url.trim_end_matches('/').to_string());
        }

        let base = self.gateway_url.as_deref()?.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            Some(format!("wss://{}", rest))
        } else {
            base.strip_prefix("http://")
                .map(|rest| format!("ws://{}", rest))
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    /// Default snapshot filter from `agency`
    pub fn agency_filter(&self) -> Option<SnapshotFilter> {
        self.agency.as_deref().map(SnapshotFilter::agency)
    }

    /// Service policies described by this configuration
    pub fn service_options(&self) -> ServiceOptions {
        let reconnect = self.reconnect.enabled.then(|| ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(
                self.reconnect.max_delay_ms.max(self.reconnect.initial_delay_ms),
            ),
        });

        ServiceOptions {
            auto_disconnect: self.auto_disconnect,
            reconnect,
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_heartbeat_secs() -> u64 {
    25
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "warn".to_string()
}
