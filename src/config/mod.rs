//! # Configuration
//!
//! TOML configuration for the collector, organized into sections:
//!
//! - [`StorageConfig`] - data directory, pool sizing, retry and keepalive knobs
//! - [`CollectorConfig`] - ingestion feature toggles and cadences
//! - [`DeviceConfig`] - radio transport device settings
//! - [`LoggingConfig`] - log level and optional file sink
//!
//! Loading never fails on unknown-but-well-formed values; [`Config::validate`]
//! is the fatal gate run once at startup, before any store is opened.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::store::{PoolConfig, RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub collector: CollectorConfig,
    pub device: DeviceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Connections kept warm in the pool.
    pub pool_min: usize,
    /// Hard ceiling on concurrent store connections.
    pub pool_max: usize,
    pub connect_timeout_secs: u64,
    /// Seconds of idle time before the health supervisor starts probing.
    pub keepalive_idle_secs: u64,
    /// Cadence of health probes once probing.
    pub keepalive_probe_secs: u64,
    /// Consecutive failed probes before the pool is reset.
    pub keepalive_failure_threshold: u32,
    /// Attempts per store operation, including the first.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Decode NODEINFO payloads inline instead of waiting for the sweep.
    pub enable_direct_nodeinfo: bool,
    pub enable_sweep: bool,
    /// Persist position data from announcements and roster entries.
    pub enable_position_tracking: bool,
    pub sweep_interval_secs: u64,
    /// Pending nodes examined per sweep cycle.
    pub sweep_max_entries: usize,
    pub stats_interval_secs: u64,
    /// Serialized event size ceiling; larger events are dropped.
    pub max_event_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub path: String,
    /// When true, startup fails unless the device path exists.
    pub require_device_at_startup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            collector: CollectorConfig::default(),
            device: DeviceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            pool_min: 1,
            pool_max: 20,
            connect_timeout_secs: 10,
            keepalive_idle_secs: 30,
            keepalive_probe_secs: 5,
            keepalive_failure_threshold: 5,
            max_retries: 5,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30000,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enable_direct_nodeinfo: true,
            enable_sweep: true,
            enable_position_tracking: false,
            sweep_interval_secs: 60,
            sweep_max_entries: 25,
            stats_interval_secs: 60,
            max_event_bytes: 16384,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyACM0".to_string(),
            require_device_at_startup: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshcollect.log".to_string()),
        }
    }
}

impl StorageConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_size: self.pool_min,
            max_size: self.pool_max,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: 2,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Write a default configuration file.
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;
        Ok(())
    }

    /// Fatal validation gate, run once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.storage.data_dir.trim().is_empty() {
            bail!("storage.data_dir must not be empty");
        }
        if self.storage.pool_min < 1 {
            bail!("storage.pool_min must be at least 1");
        }
        if self.storage.pool_min > self.storage.pool_max {
            bail!(
                "storage.pool_min ({}) exceeds storage.pool_max ({})",
                self.storage.pool_min,
                self.storage.pool_max
            );
        }
        if self.storage.max_retries < 1 {
            bail!("storage.max_retries must be at least 1");
        }
        if self.collector.sweep_max_entries < 1 {
            bail!("collector.sweep_max_entries must be at least 1");
        }
        if self.collector.max_event_bytes == 0 {
            bail!("collector.max_event_bytes must be greater than zero");
        }
        if self.device.require_device_at_startup {
            if self.device.path.trim().is_empty() {
                bail!("device.path must be set when require_device_at_startup is true");
            }
            if !Path::new(&self.device.path).exists() {
                bail!("device {} is not reachable at startup", self.device.path);
            }
        }
        Ok(())
    }
}
