//! Process configuration.
//!
//! Every component keeps its own `from_env` loader; [`AppConfig`] gathers
//! them so the binary validates everything before touching a backend.

use std::net::SocketAddr;
use std::time::Duration;

use tandem_core::ConfigError;
use tandem_storage::{CacheConfig, DbConfig, EtcdConfig, RetryConfig};

use crate::jobs::InvalidationListenerConfig;

/// Parse a millisecond duration from `name`, if set.
pub(crate) fn env_duration_ms(name: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::invalid(name, format!("expected milliseconds, got '{}'", raw))),
        Err(_) => Ok(None),
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Deadline applied to every request (default: the etcd dial timeout)
    pub request_timeout: Duration,
}

impl ServerConfig {
    /// Load from environment variables.
    ///
    /// # Environment Variables
    /// - `TANDEM_API_BIND`: Host to bind (default: 0.0.0.0)
    /// - `PORT` or `TANDEM_API_PORT`: Port to bind (default: 3000)
    /// - `TANDEM_REQUEST_TIMEOUT_MS`: Per-request deadline (default: `default_timeout`)
    pub fn from_env(default_timeout: Duration) -> Result<Self, ConfigError> {
        let request_timeout = env_duration_ms("TANDEM_REQUEST_TIMEOUT_MS")?.unwrap_or(default_timeout);
        if request_timeout.is_zero() {
            return Err(ConfigError::invalid("TANDEM_REQUEST_TIMEOUT_MS", "must be > 0"));
        }
        Ok(Self {
            bind_addr: resolve_bind_addr()?,
            request_timeout,
        })
    }
}

fn resolve_bind_addr() -> Result<SocketAddr, ConfigError> {
    let host = std::env::var("TANDEM_API_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port_str = std::env::var("PORT")
        .ok()
        .or_else(|| std::env::var("TANDEM_API_PORT").ok())
        .unwrap_or_else(|| "3000".to_string());
    let port = port_str
        .parse::<u16>()
        .map_err(|_| ConfigError::invalid("TANDEM_API_PORT", format!("invalid port value: {}", port_str)))?;

    let addr = format!("{}:{}", host, port);
    addr.parse::<SocketAddr>()
        .map_err(|e| ConfigError::invalid("TANDEM_API_BIND", format!("invalid bind address {}: {}", addr, e)))
}

/// Everything the binary needs, validated up front.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub etcd: EtcdConfig,
    pub db: DbConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub listener: InvalidationListenerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let etcd = EtcdConfig::from_env()?;
        let retry = RetryConfig::from_env()?;
        retry.validate()?;
        let server = ServerConfig::from_env(etcd.dial_timeout)?;
        Ok(Self {
            server,
            db: DbConfig::from_env(),
            retry,
            cache: CacheConfig::from_env()?,
            listener: InvalidationListenerConfig::from_env()?,
            etcd,
        })
    }
}
