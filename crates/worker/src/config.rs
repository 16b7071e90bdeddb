//! Worker configuration
//!
//! Configuration via environment variables:
//! - `DATABASE_URL`: Postgres connection string (required)
//! - `DEFERRED_CHANGE_CRON`: schedule for applying due plan changes (default: every 15 minutes)
//! - `DATABASE_MAX_CONNECTIONS`: pool size (default: 3)
//! - `LOG_FORMAT`: `json` for structured output, anything else for plain text

use std::env;
use thiserror::Error;

/// Default schedule, with seconds: every 15 minutes
const DEFAULT_CRON: &str = "0 */15 * * * *";

/// Default pool size; the worker runs one job at a time
const DEFAULT_MAX_CONNECTIONS: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: String,
    pub deferred_change_cron: String,
    pub max_connections: u32,
    pub log_json: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let deferred_change_cron =
            lookup("DEFERRED_CHANGE_CRON").unwrap_or_else(|| DEFAULT_CRON.to_string());

        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(value) => value
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid {
                    name: "DATABASE_MAX_CONNECTIONS",
                    value,
                })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let log_json = lookup("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            deferred_change_cron,
            max_connections,
            log_json,
        })
    }
}
