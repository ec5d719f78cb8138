//! # Configuration Management Module
//!
//! Settings for discovery, health checking, dispatch, prescription ingestion,
//! persistence and logging. Every section carries serde defaults, so a partial
//! file (or an empty one) loads into a working configuration.
//!
//! ## Configuration Structure
//!
//! - [`NetworkConfig`] - subnet prefix, device port, scan cadence, reconnect budget
//! - [`HealthConfig`] - health cycle period, timeout backoff, post-dispense cooldown
//! - [`DispenseConfig`] - busy hold after a dispense, request timeout, volume limit
//! - [`IngestConfig`] - watched directory, file format, encoding chain
//! - [`StorageConfig`] - state directory
//! - [`LoggingConfig`] - level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use syrupnet::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     println!("scanning every {:?}", config.network.scan_interval());
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [network]
//! prefix = "192.168.1"        # empty = derive from the primary interface
//! device_port = 80
//! scan_interval_secs = 10
//! probe_timeout_ms = 5000
//! max_reconnect_attempts = 3
//!
//! [health]
//! interval_secs = 15
//! cooldown_secs = 60
//!
//! [dispense]
//! busy_hold_secs = 30
//! max_volume = 100
//!
//! [ingest]
//! directory = "C:/Rx/export"
//! format = "text"             # or "xml"
//! encodings = ["euc-kr", "utf-8"]
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::prescription::PrescriptionFormat;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub dispense: DispenseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// First three octets of the scanned /24, e.g. "192.168.1". Empty means
    /// detect from the host's primary IPv4 address.
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_device_port")]
    pub device_port: u16,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Explicit reconnect attempts per unreachable device before giving up
    /// until a manual connect succeeds.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_device_port() -> u16 {
    80
}
fn default_scan_interval_secs() -> u64 {
    10
}
fn default_probe_timeout_ms() -> u64 {
    5000
}
fn default_max_reconnect_attempts() -> u32 {
    3
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            device_port: default_device_port(),
            scan_interval_secs: default_scan_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl NetworkConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Pause before the single retry of a timed-out probe.
    #[serde(default = "default_timeout_backoff_ms")]
    pub timeout_backoff_ms: u64,
    /// Health cycles are suppressed for this long after a dispatch starts.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_health_interval_secs() -> u64 {
    15
}
fn default_timeout_backoff_ms() -> u64 {
    1000
}
fn default_cooldown_secs() -> u64 {
    60
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            timeout_backoff_ms: default_timeout_backoff_ms(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
    pub fn timeout_backoff(&self) -> Duration {
        Duration::from_millis(self.timeout_backoff_ms)
    }
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispenseConfig {
    /// How long a device stays busy after accepting a command.
    #[serde(default = "default_busy_hold_secs")]
    pub busy_hold_secs: u64,
    #[serde(default = "default_dispense_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Default per-item ceiling; the persisted auto-dispense settings override it.
    #[serde(default = "default_max_volume")]
    pub max_volume: u32,
}

fn default_busy_hold_secs() -> u64 {
    30
}
fn default_dispense_timeout_ms() -> u64 {
    30_000
}
fn default_max_volume() -> u32 {
    100
}

impl Default for DispenseConfig {
    fn default() -> Self {
        Self {
            busy_hold_secs: default_busy_hold_secs(),
            request_timeout_ms: default_dispense_timeout_ms(),
            max_volume: default_max_volume(),
        }
    }
}

impl DispenseConfig {
    pub fn busy_hold(&self) -> Duration {
        Duration::from_secs(self.busy_hold_secs)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Watched directory. The persisted path from `syrupnet set-path` wins over this.
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay between ingestion and handing a record to auto-dispatch.
    #[serde(default = "default_settle_ms")]
    pub auto_dispatch_settle_ms: u64,
    /// Encoding labels tried in order (WHATWG names, e.g. "euc-kr", "utf-8").
    #[serde(default = "default_encodings")]
    pub encodings: Vec<String>,
    /// Minimum share of Hangul among alphabetic characters for a decoding to count.
    #[serde(default = "default_hangul_ratio")]
    pub min_hangul_ratio: f64,
}

fn default_format() -> String {
    "text".to_string()
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_settle_ms() -> u64 {
    300
}
fn default_encodings() -> Vec<String> {
    vec!["euc-kr".to_string(), "utf-8".to_string()]
}
fn default_hangul_ratio() -> f64 {
    0.1
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_format(),
            poll_interval_ms: default_poll_interval_ms(),
            auto_dispatch_settle_ms: default_settle_ms(),
            encodings: default_encodings(),
            min_hangul_ratio: default_hangul_ratio(),
        }
    }
}

impl IngestConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.auto_dispatch_settle_ms)
    }
    pub fn prescription_format(&self) -> Result<PrescriptionFormat> {
        self.format.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    /// Archives kept by `syrupnet backup`; older ones are pruned.
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_backup_dir() -> String {
    "./data/backups".to_string()
}
fn default_max_backups() -> usize {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backup_dir: default_backup_dir(),
            max_backups: default_max_backups(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: Some("syrupnet.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values that would stall a periodic job or make ingestion impossible.
    pub fn validate(&self) -> Result<()> {
        if self.network.scan_interval_secs == 0 {
            return Err(anyhow!("network.scan_interval_secs must be greater than zero"));
        }
        if self.network.probe_timeout_ms == 0 {
            return Err(anyhow!("network.probe_timeout_ms must be greater than zero"));
        }
        if self.network.max_reconnect_attempts == 0 {
            return Err(anyhow!("network.max_reconnect_attempts must be at least 1"));
        }
        if !self.network.prefix.is_empty() {
            self.network
                .prefix
                .parse::<crate::network::SubnetPrefix>()
                .map_err(|e| anyhow!("network.prefix: {}", e))?;
        }
        if self.health.interval_secs == 0 {
            return Err(anyhow!("health.interval_secs must be greater than zero"));
        }
        if self.dispense.request_timeout_ms == 0 {
            return Err(anyhow!("dispense.request_timeout_ms must be greater than zero"));
        }
        if self.ingest.poll_interval_ms == 0 {
            return Err(anyhow!("ingest.poll_interval_ms must be greater than zero"));
        }
        if self.ingest.encodings.is_empty() {
            return Err(anyhow!("ingest.encodings must name at least one encoding"));
        }
        for label in &self.ingest.encodings {
            if encoding_rs::Encoding::for_label(label.as_bytes()).is_none() {
                return Err(anyhow!("ingest.encodings: unknown encoding '{}'", label));
            }
        }
        if !(0.0..=1.0).contains(&self.ingest.min_hangul_ratio) {
            return Err(anyhow!("ingest.min_hangul_ratio must be between 0 and 1"));
        }
        self.ingest.prescription_format()?;
        Ok(())
    }
}
