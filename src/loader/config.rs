//! Loader configuration
//!
//! Set once before the loader is built. Every field has a default, so a YAML
//! file only needs the settings it changes:
//!
//! ```yaml
//! disk_path: /var/cache/tierfetch
//! memory_budget: 67108864
//! network_class: broadband-mobile
//! history_redirect: never
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{
    DEFAULT_DISK_BUDGET, DEFAULT_HISTORY_CAPACITY, DEFAULT_MEMORY_BUDGET,
    DEFAULT_QUARANTINE_BUDGET,
};
use crate::error::{Error, Result};
use crate::network::downloader::{
    DEFAULT_MAX_CONNECTIONS, DEFAULT_PROBE_SIZE, DEFAULT_SPLIT_THRESHOLD, DEFAULT_WATCH_INTERVAL,
};
use crate::network::{
    DownloaderConfig, HistoryRedirect, LowSpeedStrategy, NetworkClass, NetworkSettings, Timeouts,
    DEFAULT_CONNECTION_SPEED,
};
use crate::sink::DEFAULT_MEMORY_SINK_LIMIT;

/// Default resource identifier length limit (8KB)
pub const DEFAULT_URL_LENGTH_LIMIT: usize = 8 * 1024;

/// Loader configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    // Budgets
    pub memory_budget: u64,
    pub quarantine_budget: u64,
    pub disk_budget: u64,
    /// Disk cache directory
    pub disk_path: PathBuf,

    // Concurrency ceilings
    pub memory_concurrency: usize,
    pub disk_concurrency: usize,
    pub network_concurrency: usize,

    // Timeouts
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Caller timeout = factor × (connect + read)
    pub caller_timeout_factor: u32,

    // Low-speed strategy
    pub network_class: NetworkClass,
    pub low_speed: LowSpeedStrategy,

    // Downloader
    pub max_connections: usize,
    pub min_connections: usize,
    pub probe_size: u64,
    pub split_threshold: u64,
    /// Assumed per-connection speed for hosts never measured (bytes/s)
    pub default_connection_speed: u64,
    pub watch_interval_ms: u64,

    // History
    pub history_capacity: usize,
    pub history_redirect: HistoryRedirect,

    // Limits
    pub url_length_limit: usize,
    pub data_length_limit: Option<u64>,
    /// Largest body buffered in memory while the disk is unusable
    pub memory_buffer_limit: u64,

    /// Minimum time between recovery writes while the disk is unhealthy
    pub disk_recovery_interval_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            memory_budget: DEFAULT_MEMORY_BUDGET,
            quarantine_budget: DEFAULT_QUARANTINE_BUDGET,
            disk_budget: DEFAULT_DISK_BUDGET,
            disk_path: std::env::temp_dir().join("tierfetch"),
            memory_concurrency: 1,
            disk_concurrency: 2,
            network_concurrency: 4,
            connect_timeout_ms: 3000,
            read_timeout_ms: 5000,
            caller_timeout_factor: 3,
            network_class: NetworkClass::Wifi,
            low_speed: LowSpeedStrategy::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 1,
            probe_size: DEFAULT_PROBE_SIZE,
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            default_connection_speed: DEFAULT_CONNECTION_SPEED,
            watch_interval_ms: DEFAULT_WATCH_INTERVAL.as_millis() as u64,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_redirect: HistoryRedirect::default(),
            url_length_limit: DEFAULT_URL_LENGTH_LIMIT,
            data_length_limit: None,
            memory_buffer_limit: DEFAULT_MEMORY_SINK_LIMIT,
            disk_recovery_interval_ms: 5000,
        }
    }
}

impl LoaderConfig {
    /// Defaults with the disk cache under `disk_path`
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
            ..Self::default()
        }
    }

    /// Parse YAML; absent fields keep their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid loader config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }

    /// Check every setting before any task runs
    pub fn validate(&self) -> Result<()> {
        if self.memory_budget == 0 {
            return Err(Error::Config("memory_budget must be > 0".into()));
        }
        if self.disk_budget == 0 {
            return Err(Error::Config("disk_budget must be > 0".into()));
        }
        if self.disk_path.as_os_str().is_empty() {
            return Err(Error::Config("disk_path must be set".into()));
        }
        if self.memory_concurrency == 0 || self.disk_concurrency == 0 || self.network_concurrency == 0
        {
            return Err(Error::Config("tier concurrency must be >= 1".into()));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be > 0".into()));
        }
        if self.caller_timeout_factor == 0 {
            return Err(Error::Config("caller_timeout_factor must be >= 1".into()));
        }
        if self.min_connections == 0 || self.min_connections > self.max_connections {
            return Err(Error::Config(format!(
                "connections must satisfy 1 <= min ({}) <= max ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.probe_size == 0 {
            return Err(Error::Config("probe_size must be > 0".into()));
        }
        if self.watch_interval_ms == 0 {
            return Err(Error::Config("watch_interval_ms must be > 0".into()));
        }
        if self.history_capacity == 0 {
            return Err(Error::Config("history_capacity must be >= 1".into()));
        }
        if self.url_length_limit == 0 {
            return Err(Error::Config("url_length_limit must be > 0".into()));
        }
        if self.memory_buffer_limit == 0 {
            return Err(Error::Config("memory_buffer_limit must be > 0".into()));
        }
        self.low_speed.validate()
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::new(
            Duration::from_millis(self.connect_timeout_ms),
            Duration::from_millis(self.read_timeout_ms),
        )
    }

    /// Caller-facing timeout for a request
    pub fn caller_timeout(&self, indispensable: bool) -> Duration {
        let timeouts = if indispensable {
            self.timeouts().relaxed()
        } else {
            self.timeouts()
        };
        timeouts.caller_timeout(self.caller_timeout_factor)
    }

    pub fn downloader(&self) -> DownloaderConfig {
        DownloaderConfig {
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            probe_size: self.probe_size,
            split_threshold: self.split_threshold,
            watch_interval: Duration::from_millis(self.watch_interval_ms),
        }
    }

    pub fn network(&self) -> NetworkSettings {
        NetworkSettings {
            timeouts: self.timeouts(),
            network_class: self.network_class,
            low_speed: self.low_speed.clone(),
            history_redirect: self.history_redirect,
            data_length_limit: self.data_length_limit,
            memory_buffer_limit: self.memory_buffer_limit,
        }
    }

    pub fn disk_recovery_interval(&self) -> Duration {
        Duration::from_millis(self.disk_recovery_interval_ms)
    }
}
