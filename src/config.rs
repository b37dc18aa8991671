// Configuration module - reads exporter settings from the environment
//
// This module is responsible for:
// 1. Reading the METRICS_* and database environment variables
// 2. Applying defaults for anything unset
// 3. Validating durations, ports and pool bounds before anything starts
// 4. Providing strongly-typed access to settings
//
// Any error here is fatal: the exporter refuses to start on bad config.

use serde::Serialize;
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::db::PoolOptions;
use crate::time_window::{parse_interval, TimeWindow, TimeWindowError};

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid duration in {var}: {source}")]
    InvalidWindow {
        var: &'static str,
        #[source]
        source: TimeWindowError,
    },

    #[error("Invalid number in {var}: '{value}'")]
    InvalidNumber { var: &'static str, value: String },

    #[error("Invalid pool bounds: DB_MIN_CONNECTIONS={min} must not exceed DB_MAX_CONNECTIONS={max}, and the maximum must be positive")]
    InvalidPoolBounds { min: usize, max: usize },

    #[error("METRICS_UPDATE_INTERVAL must be greater than zero")]
    ZeroInterval,
}

/// Connection parameters for the Open WebUI PostgreSQL database
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSettings {
    pub name: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl DatabaseSettings {
    /// Connection URL, password included
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// All exporter settings
///
/// # Environment
/// ```text
/// METRICS_PORT=9090
/// METRICS_UPDATE_INTERVAL=15m        # or raw seconds, e.g. 900
/// METRICS_REQUEST_WINDOW=24h
/// METRICS_ERROR_WINDOW=1h
/// OPENWEBUI_DB_NAME=openwebui
/// OPENWEBUI_DB_USER=postgres
/// OPENWEBUI_DB_PASSWORD=
/// OPENWEBUI_DB_HOST=localhost
/// OPENWEBUI_DB_PORT=5432
/// DB_MIN_CONNECTIONS=5
/// DB_MAX_CONNECTIONS=20
/// DB_ACQUIRE_TIMEOUT=30
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Port the scrape endpoint listens on
    pub metrics_port: u16,

    /// Pause between two collection cycles
    pub update_interval: TimeWindow,

    /// Look-back window reserved for request-bounded queries
    pub request_window: TimeWindow,

    /// Look-back window reserved for error-bounded queries
    pub error_window: TimeWindow,

    pub database: DatabaseSettings,

    pub min_connections: usize,
    pub max_connections: usize,

    /// How long a collection cycle waits for a free connection
    pub acquire_timeout: TimeWindow,
}

impl Settings {
    /// Loads settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads settings through an arbitrary variable lookup
    ///
    /// # Arguments
    /// * `lookup` - Returns the value of a variable, or `None` when unset
    ///
    /// # Returns
    /// * `Ok(Settings)` - Every value parsed and validated
    /// * `Err(ConfigError)` - The first invalid value encountered
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |var: &str, default: &str| lookup(var).unwrap_or_else(|| default.to_string());

        let metrics_port = number(&text, "METRICS_PORT", "9090")?;

        let update_interval = parse_interval(&text("METRICS_UPDATE_INTERVAL", "15m"))
            .map_err(|source| ConfigError::InvalidWindow {
                var: "METRICS_UPDATE_INTERVAL",
                source,
            })?;
        if update_interval.as_secs() == 0 {
            return Err(ConfigError::ZeroInterval);
        }

        let request_window = window(&text, "METRICS_REQUEST_WINDOW", "24h")?;
        let error_window = window(&text, "METRICS_ERROR_WINDOW", "1h")?;

        let acquire_timeout = parse_interval(&text("DB_ACQUIRE_TIMEOUT", "30")).map_err(
            |source| ConfigError::InvalidWindow {
                var: "DB_ACQUIRE_TIMEOUT",
                source,
            },
        )?;

        let database = DatabaseSettings {
            name: text("OPENWEBUI_DB_NAME", "openwebui"),
            user: text("OPENWEBUI_DB_USER", "postgres"),
            password: text("OPENWEBUI_DB_PASSWORD", ""),
            host: text("OPENWEBUI_DB_HOST", "localhost"),
            port: number(&text, "OPENWEBUI_DB_PORT", "5432")?,
        };

        let min_connections: usize = number(&text, "DB_MIN_CONNECTIONS", "5")?;
        let max_connections: usize = number(&text, "DB_MAX_CONNECTIONS", "20")?;
        if max_connections == 0 || min_connections > max_connections {
            return Err(ConfigError::InvalidPoolBounds {
                min: min_connections,
                max: max_connections,
            });
        }

        Ok(Settings {
            metrics_port,
            update_interval,
            request_window,
            error_window,
            database,
            min_connections,
            max_connections,
            acquire_timeout,
        })
    }

    /// Pool sizing derived from these settings
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            acquire_timeout: self.acquire_timeout.as_duration(),
        }
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval.as_duration()
    }

    /// Logs every setting (the password is never serialized)
    pub fn log_summary(&self) {
        info!("Metrics port: {}", self.metrics_port);
        info!("Update interval: {}", self.update_interval);
        info!(
            "Query windows: request={}, error={}",
            self.request_window, self.error_window
        );
        info!(
            "Database: {}@{}:{}/{}",
            self.database.user, self.database.host, self.database.port, self.database.name
        );
        info!(
            "Pool bounds: min={}, max={}, acquire timeout={}",
            self.min_connections, self.max_connections, self.acquire_timeout
        );

        if let Ok(json) = serde_json::to_string(self) {
            debug!("Effective settings: {}", json);
        }
    }
}

fn number<T, F>(text: &F, var: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str, &str) -> String,
{
    let value = text(var, default);
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber { var, value })
}

fn window<F>(text: &F, var: &'static str, default: &str) -> Result<TimeWindow, ConfigError>
where
    F: Fn(&str, &str) -> String,
{
    TimeWindow::parse(&text(var, default))
        .map_err(|source| ConfigError::InvalidWindow { var, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = load(&[]).unwrap();

        assert_eq!(settings.metrics_port, 9090);
        assert_eq!(settings.update_interval.as_secs(), 900);
        assert_eq!(settings.request_window.as_secs(), 86_400);
        assert_eq!(settings.error_window.as_secs(), 3_600);
        assert_eq!(settings.database.name, "openwebui");
        assert_eq!(settings.database.user, "postgres");
        assert_eq!(settings.database.password, "");
        assert_eq!(settings.database.host, "localhost");
        assert_eq!(settings.database.port, 5432);
        assert_eq!(settings.min_connections, 5);
        assert_eq!(settings.max_connections, 20);
        assert_eq!(settings.pool_options().acquire_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_interval_accepts_raw_seconds() {
        let settings = load(&[("METRICS_UPDATE_INTERVAL", "45")]).unwrap();
        assert_eq!(settings.update_interval(), Duration::from_secs(45));
    }

    #[test]
    fn test_interval_rejects_garbage_and_zero() {
        assert!(matches!(
            load(&[("METRICS_UPDATE_INTERVAL", "soon")]),
            Err(ConfigError::InvalidWindow {
                var: "METRICS_UPDATE_INTERVAL",
                ..
            })
        ));
        assert!(matches!(
            load(&[("METRICS_UPDATE_INTERVAL", "0m")]),
            Err(ConfigError::ZeroInterval)
        ));
    }

    #[test]
    fn test_windows_do_not_accept_raw_seconds() {
        assert!(matches!(
            load(&[("METRICS_REQUEST_WINDOW", "3600")]),
            Err(ConfigError::InvalidWindow {
                var: "METRICS_REQUEST_WINDOW",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_numbers() {
        assert!(matches!(
            load(&[("METRICS_PORT", "http")]),
            Err(ConfigError::InvalidNumber {
                var: "METRICS_PORT",
                ..
            })
        ));
        assert!(matches!(
            load(&[("OPENWEBUI_DB_PORT", "70000")]),
            Err(ConfigError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_pool_bounds() {
        assert!(matches!(
            load(&[("DB_MIN_CONNECTIONS", "10"), ("DB_MAX_CONNECTIONS", "2")]),
            Err(ConfigError::InvalidPoolBounds { min: 10, max: 2 })
        ));
        assert!(matches!(
            load(&[("DB_MIN_CONNECTIONS", "0"), ("DB_MAX_CONNECTIONS", "0")]),
            Err(ConfigError::InvalidPoolBounds { .. })
        ));

        let settings = load(&[("DB_MIN_CONNECTIONS", "1"), ("DB_MAX_CONNECTIONS", "3")]).unwrap();
        let options = settings.pool_options();
        assert_eq!(options.min_connections, 1);
        assert_eq!(options.max_connections, 3);
    }

    #[test]
    fn test_password_is_not_serialized() {
        let settings = load(&[("OPENWEBUI_DB_PASSWORD", "hunter2")]).unwrap();
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(settings.database.url().contains("hunter2"));
    }
}
