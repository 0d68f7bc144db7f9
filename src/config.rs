use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;

use crate::engine::{EngineConfig, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{0}")]
    Constraint(&'static str),
}

/// Service settings, read from `ARTSLOT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub utc_offset: FixedOffset,
    pub hold_ttl: Duration,
    pub max_hold_ttl: Duration,
    pub sweep_interval: Duration,
    pub store_retries: u32,
    pub retry_backoff: Duration,
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let offset_minutes: i32 = parse(&lookup, "ARTSLOT_UTC_OFFSET_MINUTES", 0)?;
        let utc_offset = FixedOffset::east_opt(offset_minutes * 60)
            .ok_or(ConfigError::Constraint("ARTSLOT_UTC_OFFSET_MINUTES out of range"))?;

        let metrics_port = match lookup("ARTSLOT_METRICS_PORT") {
            None => None,
            Some(value) => Some(value.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "ARTSLOT_METRICS_PORT",
                value,
            })?),
        };

        let config = Self {
            bind: lookup("ARTSLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&lookup, "ARTSLOT_PORT", 8080)?,
            data_dir: PathBuf::from(lookup("ARTSLOT_DATA_DIR").unwrap_or_else(|| "./data".into())),
            utc_offset,
            hold_ttl: Duration::from_secs(parse(&lookup, "ARTSLOT_HOLD_TTL_SECS", 600)?),
            max_hold_ttl: Duration::from_secs(parse(&lookup, "ARTSLOT_MAX_HOLD_TTL_SECS", 3600)?),
            sweep_interval: Duration::from_secs(parse(&lookup, "ARTSLOT_SWEEP_INTERVAL_SECS", 30)?),
            store_retries: parse(&lookup, "ARTSLOT_STORE_RETRIES", 1)?,
            retry_backoff: Duration::from_millis(parse(&lookup, "ARTSLOT_RETRY_BACKOFF_MS", 50)?),
            compact_threshold: parse(&lookup, "ARTSLOT_COMPACT_THRESHOLD", 1000)?,
            compact_interval: Duration::from_secs(parse(&lookup, "ARTSLOT_COMPACT_INTERVAL_SECS", 60)?),
            metrics_port,
        };

        if config.hold_ttl.is_zero() || config.hold_ttl > config.max_hold_ttl {
            return Err(ConfigError::Constraint(
                "ARTSLOT_HOLD_TTL_SECS must be positive and at most ARTSLOT_MAX_HOLD_TTL_SECS",
            ));
        }
        if config.sweep_interval.is_zero() || config.compact_interval.is_zero() {
            return Err(ConfigError::Constraint("background intervals must be positive"));
        }
        Ok(config)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            utc_offset: self.utc_offset,
            default_hold_ttl: self.hold_ttl,
            max_hold_ttl: self.max_hold_ttl,
            retry: RetryPolicy {
                retries: self.store_retries,
                backoff: self.retry_backoff,
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("artslot.wal")
    }
}
