//! Environment-driven configuration
//!
//! | Variable | Default |
//! |---|---|
//! | `AUTODRAIN_POLL_INTERVAL_SECS` | 5 |
//! | `AUTODRAIN_DRAIN_TIMEOUT_SECS` | 600 |
//! | `AUTODRAIN_MAX_CONCURRENT_ACTIONS` | 4 |
//! | `AUTODRAIN_QUEUE_CAPACITY` | 256 |
//! | `AUTODRAIN_WATCH_BACKOFF_MAX_SECS` | 30 |
//! | `AUTODRAIN_HEALTH_PORT` | 8080 |

use crate::controller::DrainSettings;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_CONCURRENT_ACTIONS: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_WATCH_BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub drain: DrainSettings,
    /// Upper bound on drains/uncordons running at the same time (across nodes)
    pub max_concurrent_actions: usize,
    pub queue_capacity: usize,
    pub watch_backoff_max: Duration,
    pub health_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            drain: DrainSettings::default(),
            max_concurrent_actions: DEFAULT_MAX_CONCURRENT_ACTIONS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            watch_backoff_max: DEFAULT_WATCH_BACKOFF_MAX,
            health_port: DEFAULT_HEALTH_PORT,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup
    ///
    /// Tests use this instead of `from_env` so they never race on the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let poll_interval = secs(
            &lookup,
            "AUTODRAIN_POLL_INTERVAL_SECS",
            defaults.drain.poll_interval,
        )?;
        let timeout = secs(
            &lookup,
            "AUTODRAIN_DRAIN_TIMEOUT_SECS",
            defaults.drain.timeout,
        )?;
        let max_concurrent_actions = parse(
            &lookup,
            "AUTODRAIN_MAX_CONCURRENT_ACTIONS",
            defaults.max_concurrent_actions,
        )?;
        let queue_capacity = parse(&lookup, "AUTODRAIN_QUEUE_CAPACITY", defaults.queue_capacity)?;
        let watch_backoff_max = secs(
            &lookup,
            "AUTODRAIN_WATCH_BACKOFF_MAX_SECS",
            defaults.watch_backoff_max,
        )?;
        let health_port = parse(&lookup, "AUTODRAIN_HEALTH_PORT", defaults.health_port)?;

        Ok(Self {
            drain: DrainSettings {
                poll_interval,
                timeout,
            },
            max_concurrent_actions,
            queue_capacity,
            watch_backoff_max,
            health_port,
        })
    }
}

/// Parse a positive integer, falling back to `default` when unset
fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value = raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse(lookup, key, default.as_secs()).map(Duration::from_secs)
}
