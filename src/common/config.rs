//! Runtime configuration loaded from the process environment.
//!
//! `PORT` keeps the name the deployment already uses; everything else lives
//! under the `ML_SERVICES_` prefix.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
/// The queue buffer is allocated up front, so it is bounded.
pub const MAX_QUEUE_CAPACITY: usize = 65_536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings consumed by the request dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchCfg {
    /// Worker threads executing scorer calls.
    pub workers: usize,
    /// Requests allowed to wait for a worker before admission fails fast.
    pub queue_capacity: usize,
    /// Caller-observed budget per request, queue wait included.
    pub timeout: Duration,
    /// Extra attempts granted to scorers that declare themselves idempotent.
    pub score_retries: u32,
    /// How long shutdown waits for busy workers before detaching them.
    pub shutdown_grace: Duration,
}

impl Default for DispatchCfg {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            score_retries: 0,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl DispatchCfg {
    /// Maximum number of requests in flight (running plus queued).
    pub fn capacity(&self) -> usize {
        self.workers.saturating_add(self.queue_capacity)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogCfg {
    /// `tracing` filter directive, e.g. `info` or `ml_services=debug`.
    pub filter: String,
    pub json: bool,
}

impl Default for LogCfg {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: true,
        }
    }
}

/// Snapshot of configuration values consumed by the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppCfg {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
    pub dispatch: DispatchCfg,
    pub log: LogCfg,
}

impl Default for AppCfg {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            dispatch: DispatchCfg::default(),
            log: LogCfg::default(),
        }
    }
}

impl AppCfg {
    /// Create a configuration snapshot from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let host = get("ML_SERVICES_HOST").unwrap_or(defaults.host);
        let port = parse_or(get("PORT"), "PORT", defaults.port)?;
        let max_body_bytes = parse_or(
            get("ML_SERVICES_MAX_BODY_BYTES"),
            "ML_SERVICES_MAX_BODY_BYTES",
            defaults.max_body_bytes,
        )?;

        let workers = parse_or(
            get("ML_SERVICES_WORKERS"),
            "ML_SERVICES_WORKERS",
            defaults.dispatch.workers,
        )?
        .max(1);
        let queue_capacity = parse_or(
            get("ML_SERVICES_QUEUE_CAPACITY"),
            "ML_SERVICES_QUEUE_CAPACITY",
            defaults.dispatch.queue_capacity,
        )?;
        if queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::Invalid {
                key: "ML_SERVICES_QUEUE_CAPACITY",
                value: queue_capacity.to_string(),
                reason: format!("must be at most {MAX_QUEUE_CAPACITY}"),
            });
        }
        let timeout_ms = parse_or(
            get("ML_SERVICES_TIMEOUT_MS"),
            "ML_SERVICES_TIMEOUT_MS",
            DEFAULT_TIMEOUT_MS,
        )?
        .max(1);
        let score_retries = parse_or(
            get("ML_SERVICES_SCORE_RETRIES"),
            "ML_SERVICES_SCORE_RETRIES",
            defaults.dispatch.score_retries,
        )?;
        let shutdown_grace_ms = parse_or(
            get("ML_SERVICES_SHUTDOWN_GRACE_MS"),
            "ML_SERVICES_SHUTDOWN_GRACE_MS",
            DEFAULT_SHUTDOWN_GRACE_MS,
        )?;

        let filter = get("RUST_LOG")
            .or_else(|| get("ML_SERVICES_LOG"))
            .unwrap_or(defaults.log.filter);
        let json = match get("ML_SERVICES_LOG_JSON") {
            Some(value) => parse_bool("ML_SERVICES_LOG_JSON", &value)?,
            None => defaults.log.json,
        };

        Ok(Self {
            host,
            port,
            max_body_bytes,
            dispatch: DispatchCfg {
                workers,
                queue_capacity,
                timeout: Duration::from_millis(timeout_ms),
                score_retries,
                shutdown_grace: Duration::from_millis(shutdown_grace_ms),
            },
            log: LogCfg { filter, json },
        })
    }

    /// Socket address the HTTP server binds to.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse().map_err(|err: std::net::AddrParseError| ConfigError::Invalid {
            key: "ML_SERVICES_HOST",
            value: self.host.clone(),
            reason: err.to_string(),
        })
    }
}

fn parse_or<T>(raw: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
            value,
        }),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
