use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub version: u32,
    pub sync: SyncConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Messages fetched on a first sync and when healing a lost cursor.
    pub initial_batch_size: usize,
    pub connect_timeout_secs: u64,
    /// Bounds each server round trip of a poll, not the poll as a whole.
    pub io_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_parallel_per_host: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 10,
            connect_timeout_secs: 10,
            io_timeout_secs: 30,
            poll_interval_secs: 120,
            max_parallel_per_host: 2,
        }
    }
}

impl SyncConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            sync: SyncConfig::default(),
            database: DatabaseConfig {
                file_name: "mailtide.sqlite3".to_string(),
            },
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.initial_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "sync.initial_batch_size must be at least 1".to_string(),
            ));
        }
        if self.sync.connect_timeout_secs == 0 || self.sync.io_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync timeouts must be greater than zero".to_string(),
            ));
        }
        if self.sync.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.sync.max_parallel_per_host == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_parallel_per_host must be at least 1".to_string(),
            ));
        }
        if self.database.file_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "database.file_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
