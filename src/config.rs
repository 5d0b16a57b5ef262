//! WolfSync Configuration
//!
//! This module provides configuration structures for a live table
//! mirror: which table to follow, how rows are keyed, and how writes
//! are coalesced and broadcast to peer sessions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main WolfSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfSyncConfig {
    /// Table mirror configuration
    pub store: StoreConfig,

    /// Broadcast side-channel configuration
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Table mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Remote table to mirror
    pub table: String,

    /// Field whose value identifies a row
    #[serde(default = "default_index_name")]
    pub index_name: String,

    /// Coalescing window in milliseconds (unset = write every mutation through)
    #[serde(default)]
    pub mutate_interval_ms: Option<u64>,
}

/// Broadcast side-channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Event name used for coalesced row payloads
    #[serde(default = "default_broadcast_event")]
    pub event: String,

    /// Maximum send attempts per payload
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between send attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_index_name() -> String {
    "id".to_string()
}

fn default_broadcast_event() -> String {
    "mutate".to_string()
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl StoreConfig {
    /// Create a config for `table` with default keying and no coalescing
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            index_name: default_index_name(),
            mutate_interval_ms: None,
        }
    }

    /// Set the coalescing window
    pub fn with_mutate_interval(mut self, interval_ms: u64) -> Self {
        self.mutate_interval_ms = Some(interval_ms);
        self
    }

    /// Set the index field name
    pub fn with_index_name(mut self, index_name: impl Into<String>) -> Self {
        self.index_name = index_name.into();
        self
    }

    /// Get the coalescing window as Duration
    pub fn mutate_interval(&self) -> Option<Duration> {
        self.mutate_interval_ms.map(Duration::from_millis)
    }
}

impl BroadcastConfig {
    /// Get the retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            event: default_broadcast_event(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl WolfSyncConfig {
    /// Build a config around a store section, defaults elsewhere
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            broadcast: BroadcastConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.store.table.is_empty() {
            return Err(crate::Error::Config("store.table cannot be empty".into()));
        }

        if self.store.index_name.is_empty() {
            return Err(crate::Error::Config("store.index_name cannot be empty".into()));
        }

        if self.broadcast.retry_attempts == 0 {
            return Err(crate::Error::Config(
                "broadcast.retry_attempts must be at least 1".into(),
            ));
        }

        if self.broadcast.event.is_empty() {
            return Err(crate::Error::Config("broadcast.event cannot be empty".into()));
        }

        Ok(())
    }
}
