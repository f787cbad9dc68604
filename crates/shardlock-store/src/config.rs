//! Configuration for a session store instance.

use std::time::Duration;

use crate::error::{Result, StoreError};

/// Sessions expire after this many idle minutes unless configured otherwise.
pub const DEFAULT_TIMEOUT_MINUTES: u32 = 20;

/// Default interval between expiration sweeps.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(10);

/// Largest supported partition count.
pub const MAX_PARTITIONS: usize = 64;

/// Bounds on the polling interval, in seconds.
pub const POLLING_INTERVAL_RANGE_SECS: std::ops::RangeInclusive<u64> = 1..=120;

/// Values consumed by the store, sweeper and coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Tenant whose sessions this instance serves.
    pub application: String,

    /// Logical session type; instances sharing it elect one sweeper.
    pub session_type: String,

    /// 0 or 1 for an unpartitioned store, otherwise 2 to 64.
    pub partition_count: usize,

    /// Interval between expiration sweeps.
    pub polling_interval: Duration,

    /// Sliding timeout refreshed on every read.
    pub default_timeout_minutes: u32,

    /// Passed through to the payload codec.
    pub compress_payload: bool,

    /// Whether this instance wants to run an expiration sweeper at all.
    pub expiration_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            application: "default".to_string(),
            session_type: "default".to_string(),
            partition_count: 1,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            default_timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            compress_payload: false,
            expiration_enabled: true,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = application.into();
        self
    }

    pub fn with_session_type(mut self, session_type: impl Into<String>) -> Self {
        self.session_type = session_type.into();
        self
    }

    pub fn with_partition_count(mut self, count: usize) -> Self {
        self.partition_count = count;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_default_timeout_minutes(mut self, minutes: u32) -> Self {
        self.default_timeout_minutes = minutes;
        self
    }

    pub fn with_compress_payload(mut self, compress: bool) -> Self {
        self.compress_payload = compress;
        self
    }

    pub fn with_expiration(mut self, enabled: bool) -> Self {
        self.expiration_enabled = enabled;
        self
    }

    /// True when more than one partition is configured.
    pub fn is_partitioned(&self) -> bool {
        self.partition_count > 1
    }

    /// Number of backends this configuration needs.
    pub fn effective_partitions(&self) -> usize {
        self.partition_count.max(1)
    }

    /// Reject out-of-range values. Nothing is clamped.
    pub fn validate(&self) -> Result<()> {
        if self.application.trim().is_empty() {
            return Err(StoreError::Configuration(
                "application must not be empty".to_string(),
            ));
        }
        if self.session_type.trim().is_empty() {
            return Err(StoreError::Configuration(
                "session_type must not be empty".to_string(),
            ));
        }
        if self.partition_count > MAX_PARTITIONS {
            return Err(StoreError::Configuration(format!(
                "partition_count must be 0, 1 or between 2 and {MAX_PARTITIONS}, got {}",
                self.partition_count
            )));
        }
        let interval = self.polling_interval;
        if interval.subsec_nanos() != 0 || !POLLING_INTERVAL_RANGE_SECS.contains(&interval.as_secs())
        {
            return Err(StoreError::Configuration(format!(
                "polling_interval must be a whole number of seconds between {} and {}, got {:?}",
                POLLING_INTERVAL_RANGE_SECS.start(),
                POLLING_INTERVAL_RANGE_SECS.end(),
                interval
            )));
        }
        if self.default_timeout_minutes == 0 {
            return Err(StoreError::Configuration(
                "default_timeout_minutes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
