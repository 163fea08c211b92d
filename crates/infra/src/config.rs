//! Configuration loading from the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::registry::{
    DEFAULT_PROVISION_PREFIX, DEFAULT_SET_NAME, DEFAULT_SWEEP_INTERVAL, RegistryConfig,
};
use crate::sweep::DEFAULT_BASE_TIMEOUT;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Longest accepted sweep interval (366 days). Payload retention and the
/// worker's next deadline are derived from it.
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 366 * 86_400;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is not a valid {expected}: {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// How the sweeper runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SweepMode {
    /// One sweep, then exit (for cron-style scheduling).
    #[default]
    Once,
    /// Sweep every interval until stopped.
    Loop,
}

impl FromStr for SweepMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Self::Once),
            "loop" => Ok(Self::Loop),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeferConfig {
    pub redis_url: String,
    pub database_url: Option<String>,
    pub base_timeout: Duration,
    pub sweep_interval: Duration,
    pub set_name: String,
    pub provision_prefix: String,
    pub sweep_mode: SweepMode,
}

impl Default for DeferConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            database_url: None,
            base_timeout: DEFAULT_BASE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            set_name: DEFAULT_SET_NAME.to_string(),
            provision_prefix: DEFAULT_PROVISION_PREFIX.to_string(),
            sweep_mode: SweepMode::Once,
        }
    }
}

impl DeferConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`, which returns the raw value of a
    /// variable if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let base_timeout = match lookup("DEFERQ_BASE_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(parse_positive("DEFERQ_BASE_TIMEOUT_MS", &raw)?),
            None => defaults.base_timeout,
        };
        let sweep_interval = match lookup("DEFERQ_SWEEP_INTERVAL_SECS") {
            Some(raw) => Duration::from_secs(parse_bounded(
                "DEFERQ_SWEEP_INTERVAL_SECS",
                &raw,
                MAX_SWEEP_INTERVAL_SECS,
            )?),
            None => defaults.sweep_interval,
        };
        let sweep_mode = match lookup("DEFERQ_SWEEP_MODE") {
            Some(raw) => raw.parse().map_err(|()| ConfigError::Invalid {
                name: "DEFERQ_SWEEP_MODE",
                expected: "sweep mode (once|loop)",
                value: raw.clone(),
            })?,
            None => defaults.sweep_mode,
        };

        Ok(Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            base_timeout,
            sweep_interval,
            set_name: non_empty("DEFERQ_SET_NAME", lookup("DEFERQ_SET_NAME"), defaults.set_name)?,
            provision_prefix: non_empty(
                "DEFERQ_PROVISION_PREFIX",
                lookup("DEFERQ_PROVISION_PREFIX"),
                defaults.provision_prefix,
            )?,
            sweep_mode,
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

impl From<&DeferConfig> for RegistryConfig {
    fn from(config: &DeferConfig) -> Self {
        Self {
            set_name: config.set_name.clone(),
            provision_prefix: config.provision_prefix.clone(),
            ..RegistryConfig::for_sweep_interval(config.sweep_interval)
        }
    }
}

fn parse_positive(name: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::Invalid {
            name,
            expected: "positive integer",
            value: raw.to_string(),
        }),
    }
}

fn parse_bounded(name: &'static str, raw: &str, max: u64) -> Result<u64, ConfigError> {
    match parse_positive(name, raw)? {
        value if value <= max => Ok(value),
        _ => Err(ConfigError::Invalid {
            name,
            expected: "positive integer of at most 31622400 seconds",
            value: raw.to_string(),
        }),
    }
}

fn non_empty(
    name: &'static str,
    value: Option<String>,
    default: String,
) -> Result<String, ConfigError> {
    match value {
        Some(v) if v.trim().is_empty() => Err(ConfigError::Empty(name)),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}
