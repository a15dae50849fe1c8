//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString so it
//! never ends up in logs.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub queue: QueueConfig,
}

/// Timing and retry policy shared by workers and supervisors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// How often a session's pacemaker beats.
    pub heartbeat_interval: Duration,
    /// Silence after which agents and their messages count as lost.
    pub agent_timeout: Duration,
    /// Requeue attempts before a message is left for an operator.
    pub max_retry: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            agent_timeout: Duration::from_secs(60),
            max_retry: 3,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            queue: QueueConfig::from_env()?,
        })
    }
}

impl QueueConfig {
    /// `MSGQ_HEARTBEAT_SECS`, `MSGQ_AGENT_TIMEOUT_SECS`, `MSGQ_MAX_RETRY`;
    /// unset vars keep their defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            heartbeat_interval: optional_var("MSGQ_HEARTBEAT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            agent_timeout: optional_var("MSGQ_AGENT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.agent_timeout),
            max_retry: optional_var("MSGQ_MAX_RETRY")?.unwrap_or(defaults.max_retry),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
