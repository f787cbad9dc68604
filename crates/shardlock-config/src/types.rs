//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [store]
//! application = "shop"
//! session_type = "web"
//! partition_count = 4
//! polling_interval_secs = 10
//! default_timeout_minutes = 20
//! compress_payload = false
//! expiration_enabled = true
//!
//! [backend]
//! kind = "sqlite"
//! path = "/var/lib/shardlock/sessions-{partition}.db"
//!
//! [logging]
//! level = "info"
//! json = false
//! dir = "/var/log/shardlock"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardlock_store::{DEFAULT_POLLING_INTERVAL, DEFAULT_TIMEOUT_MINUTES, StoreConfig};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardlockConfig {
    pub store: StoreSection,
    pub backend: BackendSection,
    pub logging: LoggingSection,
}

impl ShardlockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validated store settings.
    pub fn store_config(&self) -> Result<StoreConfig> {
        let config = self.store.to_store_config();
        config.validate()?;
        Ok(config)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// [store]
// ─────────────────────────────────────────────────────────────────────────────

/// Store settings (`[store]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub application: String,
    /// Sweep leadership is elected per session type.
    pub session_type: String,
    /// 0 or 1 for a single shard, otherwise 2 to 64.
    pub partition_count: usize,
    /// 1 to 120.
    pub polling_interval_secs: u64,
    pub default_timeout_minutes: u32,
    pub compress_payload: bool,
    pub expiration_enabled: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            application: "default".to_string(),
            session_type: "default".to_string(),
            partition_count: 1,
            polling_interval_secs: DEFAULT_POLLING_INTERVAL.as_secs(),
            default_timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            compress_payload: false,
            expiration_enabled: true,
        }
    }
}

impl StoreSection {
    /// Unvalidated conversion.
    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig::new()
            .with_application(self.application.clone())
            .with_session_type(self.session_type.clone())
            .with_partition_count(self.partition_count)
            .with_polling_interval(Duration::from_secs(self.polling_interval_secs))
            .with_default_timeout_minutes(self.default_timeout_minutes)
            .with_compress_payload(self.compress_payload)
            .with_expiration(self.expiration_enabled)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// [backend]
// ─────────────────────────────────────────────────────────────────────────────

/// Placeholder replaced by the partition index in sqlite paths.
pub const PARTITION_PLACEHOLDER: &str = "{partition}";

/// Which backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite,
}

/// Backend settings (`[backend]`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub kind: BackendKind,
    /// SQLite file path template. Defaults to the platform data directory.
    pub path: Option<String>,
}

impl BackendSection {
    /// One database path per partition.
    ///
    /// A multi-partition layout needs `{partition}` in the template so shards
    /// do not share a file.
    pub fn sqlite_paths(&self, partitions: usize) -> Result<Vec<PathBuf>> {
        let template = match &self.path {
            Some(path) => path.clone(),
            None => default_sqlite_template()?,
        };
        if partitions > 1 && !template.contains(PARTITION_PLACEHOLDER) {
            return Err(ConfigError::invalid(
                "backend.path",
                format!("{partitions} partitions need a '{PARTITION_PLACEHOLDER}' placeholder"),
            ));
        }
        Ok((0..partitions)
            .map(|i| PathBuf::from(template.replace(PARTITION_PLACEHOLDER, &i.to_string())))
            .collect())
    }
}

fn default_sqlite_template() -> Result<String> {
    let base = dirs::data_local_dir().ok_or_else(|| {
        ConfigError::invalid("backend.path", "no platform data directory; set it explicitly")
    })?;
    Ok(base
        .join("shardlock")
        .join(format!("sessions-{PARTITION_PLACEHOLDER}.db"))
        .display()
        .to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// [logging]
// ─────────────────────────────────────────────────────────────────────────────

/// Logging settings (`[logging]`). Command-line flags take precedence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Filter directive, e.g. `"info"` or `"shardlock_store=debug"`.
    pub level: Option<String>,
    /// JSON console output.
    pub json: bool,
    /// Directory for daily-rolling JSON log files.
    pub dir: Option<PathBuf>,
}
