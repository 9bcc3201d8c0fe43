use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::store::StoreConfig;

const WAL_FILE: &str = "bookings.wal";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("both INTERLOCK_TLS_CERT and INTERLOCK_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read once at startup from `INTERLOCK_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub lock_timeout: Duration,
    pub compact_threshold: u64,
    pub notify_queue: usize,
    /// JSON resource list; the campus defaults when unset.
    pub catalog: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let path = |key: &str| lookup(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from);

        let tls = match (path("INTERLOCK_TLS_CERT"), path("INTERLOCK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            _ => return Err(ConfigError::PartialTls),
        };

        let config = Self {
            bind: text("INTERLOCK_BIND", "0.0.0.0"),
            port: number(&lookup, "INTERLOCK_PORT", 5433),
            data_dir: PathBuf::from(text("INTERLOCK_DATA_DIR", "./data")),
            password: text("INTERLOCK_PASSWORD", "interlock"),
            max_connections: number(&lookup, "INTERLOCK_MAX_CONNECTIONS", 256),
            lock_timeout: Duration::from_millis(number(&lookup, "INTERLOCK_LOCK_TIMEOUT_MS", 2000)),
            compact_threshold: number(&lookup, "INTERLOCK_COMPACT_THRESHOLD", 1000),
            notify_queue: number(&lookup, "INTERLOCK_NOTIFY_QUEUE", 1024),
            catalog: path("INTERLOCK_CATALOG"),
            metrics_port: lookup("INTERLOCK_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            tls,
        };
        if config.max_connections == 0 {
            return Err(ConfigError::Zero("INTERLOCK_MAX_CONNECTIONS"));
        }
        if config.lock_timeout.is_zero() {
            return Err(ConfigError::Zero("INTERLOCK_LOCK_TIMEOUT_MS"));
        }
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.wal_path()).with_lock_timeout(self.lock_timeout)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Unparsable values fall back to the default with a warning.
fn number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{key}={raw:?} is not a valid number, using {default}");
            default
        }),
    }
}
