//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with FEC_)
//!
//! Every section has defaults, so `FecConfig::default()` is a complete configuration.
//!
//! # Example
//! ```no_run
//! use rust_fec::config::FecConfig;
//!
//! let config = FecConfig::load_from("config/fec.toml")?;
//! config.validate()?;
//! println!("Database at {}", config.storage.database_path.display());
//! # Ok::<(), rust_fec::error::FecError>(())
//! ```

use crate::error::{FecError, FecResult};
use crate::network::SocketAddress;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FecConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Region store settings
    pub storage: StorageConfig,
    /// Buffer drain settings
    pub buffering: BufferingConfig,
    /// External observer notification settings
    pub notification: NotificationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Region store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file holding region content and recorded series
    pub database_path: PathBuf,
    /// Cursors expected to hold at least this many bytes spill to a temporary file
    pub spill_threshold_bytes: usize,
}

/// Buffer drain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferingConfig {
    /// Upper bound on a single transport read, in milliseconds
    pub drain_timeout_ms: u64,
    /// Maximum number of regions drained concurrently by `drain_all`
    pub max_in_flight: usize,
    /// Largest packet written when pre-loading send buffers
    pub max_packet_bytes: usize,
}

/// Notification protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Observers told about database readiness and run phases
    pub observers: Vec<SocketAddress>,
    /// Whether to wait for each observer to confirm it has read the database
    pub wait_for_read_confirmation: bool,
    /// Bound on the wait for confirmations, in milliseconds
    pub confirmation_timeout_ms: u64,
    /// Whether the database path is included in the ready message
    pub send_database_path: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rust_fec".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("reports/buffer.sqlite3"),
            spill_threshold_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5000,
            max_in_flight: 8,
            max_packet_bytes: 272,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            observers: Vec::new(),
            wait_for_read_confirmation: true,
            confirmation_timeout_ms: 10_000,
            send_database_path: true,
        }
    }
}

impl BufferingConfig {
    /// Drain timeout as a `Duration`
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl NotificationConfig {
    /// Confirmation timeout as a `Duration`
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }
}

impl FecConfig {
    /// Load configuration from a specific file path
    ///
    /// Environment variables override file values with prefix FEC_, sections separated by
    /// a double underscore. Example: FEC_APPLICATION__LOG_LEVEL=debug
    pub fn load_from<P: AsRef<Path>>(path: P) -> FecResult<Self> {
        let config = Self::figment(path.as_ref()).extract()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(FecConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("FEC_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> FecResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(FecError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.storage.database_path.as_os_str().is_empty() {
            return Err(FecError::Configuration(
                "storage.database_path must not be empty".to_string(),
            ));
        }

        if self.buffering.drain_timeout_ms == 0 {
            return Err(FecError::Configuration(
                "drain_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.buffering.max_in_flight == 0 {
            return Err(FecError::Configuration(
                "max_in_flight must be greater than zero".to_string(),
            ));
        }

        // Header, timestamp and at least one key
        if self.buffering.max_packet_bytes < 10 {
            return Err(FecError::Configuration(format!(
                "max_packet_bytes {} cannot hold a single event",
                self.buffering.max_packet_bytes
            )));
        }

        if self.notification.confirmation_timeout_ms == 0 {
            return Err(FecError::Configuration(
                "confirmation_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FecConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffering.drain_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = FecConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(config.validate(), Err(FecError::Configuration(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = FecConfig::default();
        config.buffering.max_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_database_path_rejected() {
        let mut config = FecConfig::default();
        config.storage.database_path = PathBuf::new();
        assert!(matches!(config.validate(), Err(FecError::Configuration(_))));
    }

    #[test]
    fn test_load_from_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "fec.toml",
                r#"
                [application]
                log_level = "debug"

                [storage]
                database_path = "run/data.sqlite3"

                [[notification.observers]]
                notify_host = "127.0.0.1"
                notify_port = 19999
                "#,
            )?;
            jail.set_env("FEC_BUFFERING__DRAIN_TIMEOUT_MS", "250");

            let config = FecConfig::load_from("fec.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.storage.database_path, PathBuf::from("run/data.sqlite3"));
            assert_eq!(config.buffering.drain_timeout_ms, 250);
            assert_eq!(config.notification.observers.len(), 1);
            assert_eq!(config.notification.observers[0].listen_port, None);
            // untouched sections keep their defaults
            assert!(config.notification.wait_for_read_confirmation);
            Ok(())
        });
    }
}
