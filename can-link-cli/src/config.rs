//! Configuration loading and parsing

use anyhow::{Context, Result};
use can_link::diagnostics::{
    DEFAULT_DISABLE_RETRIES, DEFAULT_DISABLE_TIMEOUT, DEFAULT_ISOTP_RX_ID, DEFAULT_ISOTP_TX_ID,
};
use can_link::{ClientConfig, DatabaseConfig, DeviceConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub record: RecordConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatabaseSection {
    /// DBC file; `--dbc` on the command line takes precedence
    pub dbc: Option<PathBuf>,
    #[serde(flatten)]
    pub options: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecordConfig {
    /// JSON lines output file (default: stdout)
    pub output: Option<PathBuf>,
    /// Include undecoded frames in the output
    #[serde(default)]
    pub include_raw: bool,
    /// Sleep when the socket has nothing pending
    #[serde(default = "default_idle_sleep")]
    pub idle_sleep_ms: u64,
    /// How often queued messages are written out
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

fn default_idle_sleep() -> u64 {
    1
}

fn default_flush_interval() -> u64 {
    100
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            output: None,
            include_raw: false,
            idle_sleep_ms: default_idle_sleep(),
            flush_interval_ms: default_flush_interval(),
        }
    }
}

impl RecordConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Settings for `disable-ecu`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiagnosticsConfig {
    /// Interface the ECU is reachable on (default: the device interface)
    pub interface: Option<String>,
    #[serde(default = "default_rx_id")]
    pub rx_id: u32,
    #[serde(default = "default_tx_id")]
    pub tx_id: u32,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_response_timeout")]
    pub timeout_ms: u64,
}

fn default_rx_id() -> u32 {
    DEFAULT_ISOTP_RX_ID
}

fn default_tx_id() -> u32 {
    DEFAULT_ISOTP_TX_ID
}

fn default_retries() -> u32 {
    DEFAULT_DISABLE_RETRIES
}

fn default_response_timeout() -> u64 {
    DEFAULT_DISABLE_TIMEOUT.as_millis() as u64
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            interface: None,
            rx_id: default_rx_id(),
            tx_id: default_tx_id(),
            retries: default_retries(),
            timeout_ms: default_response_timeout(),
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}
