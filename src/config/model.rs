// src/config/model.rs

use log::LevelFilter;
use serde::Deserialize;
use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

/// Top-level runtime config
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub handle: HandleConfig,
    pub query: QueryConfig,
    pub snapshot: SnapshotConfig,
    pub metrics: MetricsConfig,
}

/// Mirror of the `[logging]` table
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]                   pub enable: bool,
    #[serde(default)]                   pub file:   Option<String>,
    #[serde(default = "default_level")] pub level:  String,
}
fn default_level() -> String { "INFO".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: default_level() }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.level).map_err(|_| ConfigError::InvalidLevel(self.level.clone()))
    }
}

/// Handle correlation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleConfig {
    /// How long a CreateHandle may wait for its CloseHandle.
    pub wait_window:      Duration,
    /// SID whose hive is shown as `HKEY_CURRENT_USER`.
    pub current_user_sid: Option<String>,
}

/// Object type query pool settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    pub workers:     usize,
    pub queue_depth: usize,
    pub timeout:     Duration,
}

/// Persisted process snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// `None` disables persistence.
    pub path: Option<PathBuf>,
    pub key:  String,
}

/// Prometheus exporter
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetricsConfig {
    pub listen: Option<SocketAddr>,
}

/// Raw file layout; every table and key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub logging:  LoggingConfig,
    pub handle:   RawHandle,
    pub query:    RawQuery,
    pub snapshot: RawSnapshot,
    pub metrics:  RawMetrics,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RawHandle {
    pub wait_window:      String,
    pub current_user_sid: Option<String>,
}

impl Default for RawHandle {
    fn default() -> Self {
        Self { wait_window: "5s".into(), current_user_sid: None }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RawQuery {
    pub workers:     usize,
    pub queue_depth: usize,
    pub timeout:     String,
}

impl Default for RawQuery {
    fn default() -> Self {
        Self { workers: 2, queue_depth: 256, timeout: "500ms".into() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RawSnapshot {
    pub enable: bool,
    pub path:   String,
    pub key:    String,
}

impl Default for RawSnapshot {
    fn default() -> Self {
        Self { enable: true, path: "snapshot.json".into(), key: "ktrace-snapshot".into() }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawMetrics {
    pub listen: Option<String>,
}

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level '{0}'")]
    InvalidLevel(String),

    #[error("invalid duration '{0}': {1}")]
    InvalidDuration(String, #[source] humantime::DurationError),

    #[error("invalid listen address '{0}': {1}")]
    InvalidAddress(String, #[source] std::net::AddrParseError),

    #[error("'{field}' must be at least 1")]
    Zero { field: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn duration(s: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(s).map_err(|e| ConfigError::InvalidDuration(s.into(), e))
}

fn non_zero(field: &'static str, v: usize) -> Result<usize, ConfigError> {
    if v == 0 { Err(ConfigError::Zero { field }) } else { Ok(v) }
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        raw.logging.level_filter()?;

        let listen = match raw.metrics.listen.filter(|s| !s.is_empty()) {
            Some(s) => Some(s.parse().map_err(|e| ConfigError::InvalidAddress(s.clone(), e))?),
            None => None,
        };

        Ok(Config {
            logging: raw.logging,
            handle: HandleConfig {
                wait_window:      duration(&raw.handle.wait_window)?,
                current_user_sid: raw.handle.current_user_sid.filter(|s| !s.is_empty()),
            },
            query: QueryConfig {
                workers:     non_zero("query.workers", raw.query.workers)?,
                queue_depth: non_zero("query.queue_depth", raw.query.queue_depth)?,
                timeout:     duration(&raw.query.timeout)?,
            },
            snapshot: SnapshotConfig {
                path: raw.snapshot.enable.then(|| PathBuf::from(raw.snapshot.path)),
                key:  raw.snapshot.key,
            },
            metrics: MetricsConfig { listen },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            handle: HandleConfig {
                wait_window:      Duration::from_secs(5),
                current_user_sid: None,
            },
            query: QueryConfig {
                workers:     2,
                queue_depth: 256,
                timeout:     Duration::from_millis(500),
            },
            snapshot: SnapshotConfig {
                path: Some(PathBuf::from("snapshot.json")),
                key:  "ktrace-snapshot".into(),
            },
            metrics: MetricsConfig::default(),
        }
    }
}
