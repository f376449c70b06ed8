//! Controller configuration.
//!
//! Loaded from environment variables at startup. Unset variables fall back
//! to defaults; set but unparsable ones are an error.

use crate::error::ControllerError;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_NODE_WORKERS: u16 = 30;
const DEFAULT_POOL_WORKERS: u16 = 5;
const DEFAULT_MAX_RETRIES: u32 = 15;
const DEFAULT_HEALTH_PROBE_ADDR: &str = "0.0.0.0:8081";
const DEFAULT_BACKOFF_BASE_MS: u64 = 5;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 1000;

/// Runtime configuration of the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Node reconciliations allowed to run at once
    pub node_workers: u16,
    /// ClusterCIDR reconciliations allowed to run at once
    pub pool_workers: u16,
    /// Retries of a failing object before it is given up on
    pub max_retries: u32,
    /// Bind address of the probe/metrics server
    pub health_probe_addr: SocketAddr,
    /// First retry delay
    pub backoff_base: Duration,
    /// Retry delay cap
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            node_workers: DEFAULT_NODE_WORKERS,
            pool_workers: DEFAULT_POOL_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            health_probe_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
        }
    }
}

impl ControllerConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::InvalidConfig` when a variable is set to a
    /// value that does not parse, or a worker count is zero.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let config = Self {
            node_workers: parse_var(&lookup, "NODE_WORKERS", DEFAULT_NODE_WORKERS)?,
            pool_workers: parse_var(&lookup, "POOL_WORKERS", DEFAULT_POOL_WORKERS)?,
            max_retries: parse_var(&lookup, "MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            health_probe_addr: parse_var(
                &lookup,
                "HEALTH_PROBE_ADDR",
                DEFAULT_HEALTH_PROBE_ADDR.parse().map_err(|e| {
                    ControllerError::InvalidConfig(format!("default probe address: {e}"))
                })?,
            )?,
            backoff_base: Duration::from_millis(parse_var(
                &lookup,
                "BACKOFF_BASE_MS",
                DEFAULT_BACKOFF_BASE_MS,
            )?),
            backoff_max: Duration::from_secs(parse_var(
                &lookup,
                "BACKOFF_MAX_SECS",
                DEFAULT_BACKOFF_MAX_SECS,
            )?),
        };

        if config.node_workers == 0 || config.pool_workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "NODE_WORKERS and POOL_WORKERS must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{key}={raw:?} is not valid: {e}"))
        }),
        None => Ok(default),
    }
}
