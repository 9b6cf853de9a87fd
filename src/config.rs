//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `FOREMAN_DATABASE_URL`: PostgreSQL connection string (required by the server)
//! - `FOREMAN_DISPATCH_GRPC_ADDR`: dispatch service bind address (default: 127.0.0.1:7910)
//! - `FOREMAN_WORKER_GRPC_ADDR`: worker service bind address (default: 127.0.0.1:0)
//! - `FOREMAN_ETCD_ENDPOINTS`: comma-separated etcd endpoints (default: 127.0.0.1:2379)
//! - `FOREMAN_REGISTRY_PREFIX`: key prefix for worker registration (default: /foreman/registry)
//! - `FOREMAN_LEASE_TTL_SECS`: registration lease TTL (default: 10)
//! - `FOREMAN_STATUS_RETRY_ATTEMPTS`: status report attempts before giving up (default: 3)
//! - `FOREMAN_STATUS_RETRY_BASE_MS`: base backoff between status report attempts (default: 100)

use std::{
    env,
    net::SocketAddr,
    str::FromStr,
    sync::{OnceLock, RwLock},
};

use anyhow::{Context, Result};

/// Default dispatch service bind address
pub const DEFAULT_DISPATCH_ADDR: &str = "127.0.0.1:7910";

/// Default etcd endpoint
pub const DEFAULT_ETCD_ENDPOINT: &str = "127.0.0.1:2379";

/// Default registration key prefix
pub const DEFAULT_REGISTRY_PREFIX: &str = "/foreman/registry";

/// Global configuration cache
static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL (only the dispatch server requires it)
    pub database_url: Option<String>,

    /// Dispatch service bind address
    pub dispatch_grpc_addr: SocketAddr,

    /// Worker service bind address (port 0 picks an ephemeral port)
    pub worker_grpc_addr: SocketAddr,

    /// etcd endpoints for registration and discovery
    pub etcd_endpoints: Vec<String>,

    /// Key prefix for worker registration
    pub registry_prefix: String,

    /// Registration lease TTL in seconds
    pub lease_ttl_secs: u64,

    /// Status report attempts before giving up
    pub status_retry_attempts: u32,

    /// Base backoff between status report attempts (milliseconds)
    pub status_retry_base_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let database_url = env::var("FOREMAN_DATABASE_URL").ok();

        let dispatch_grpc_addr = env::var("FOREMAN_DISPATCH_GRPC_ADDR")
            .unwrap_or_else(|_| DEFAULT_DISPATCH_ADDR.to_string());
        let dispatch_grpc_addr = SocketAddr::from_str(&dispatch_grpc_addr)
            .context("invalid FOREMAN_DISPATCH_GRPC_ADDR format")?;

        let worker_grpc_addr =
            env::var("FOREMAN_WORKER_GRPC_ADDR").unwrap_or_else(|_| "127.0.0.1:0".to_string());
        let worker_grpc_addr = SocketAddr::from_str(&worker_grpc_addr)
            .context("invalid FOREMAN_WORKER_GRPC_ADDR format")?;

        let etcd_endpoints = env::var("FOREMAN_ETCD_ENDPOINTS")
            .unwrap_or_else(|_| DEFAULT_ETCD_ENDPOINT.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let registry_prefix = env::var("FOREMAN_REGISTRY_PREFIX")
            .unwrap_or_else(|_| DEFAULT_REGISTRY_PREFIX.to_string());

        let lease_ttl_secs = env::var("FOREMAN_LEASE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let status_retry_attempts = env::var("FOREMAN_STATUS_RETRY_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let status_retry_base_ms = env::var("FOREMAN_STATUS_RETRY_BASE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        Ok(Self {
            database_url,
            dispatch_grpc_addr,
            worker_grpc_addr,
            etcd_endpoints,
            registry_prefix,
            lease_ttl_secs,
            status_retry_attempts,
            status_retry_base_ms,
        })
    }

    /// Database URL, or an error when the variable is unset.
    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("FOREMAN_DATABASE_URL environment variable is required")
    }

    /// Create a test configuration with defaults
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            database_url: None,
            dispatch_grpc_addr: "127.0.0.1:0".parse().unwrap(),
            worker_grpc_addr: "127.0.0.1:0".parse().unwrap(),
            etcd_endpoints: vec![DEFAULT_ETCD_ENDPOINT.to_string()],
            registry_prefix: DEFAULT_REGISTRY_PREFIX.to_string(),
            lease_ttl_secs: 2,
            status_retry_attempts: 2,
            status_retry_base_ms: 10,
        }
    }
}

/// Get the global configuration, loading from environment if not yet
/// initialized. Returns a clone of the cached configuration.
pub fn try_get_config() -> Result<Config> {
    match CONFIG.get() {
        Some(lock) => Ok(lock.read().expect("config lock poisoned").clone()),
        None => {
            let config = Config::from_env()?;
            let lock = CONFIG.get_or_init(|| RwLock::new(config.clone()));
            Ok(lock.read().expect("config lock poisoned").clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dispatch_addr_parses() {
        let addr: SocketAddr = DEFAULT_DISPATCH_ADDR.parse().unwrap();
        assert_eq!(addr.port(), 7910);
    }

    #[test]
    fn test_test_config_defaults() {
        let config = Config::test_config();
        assert!(config.database_url.is_none());
        assert!(config.require_database_url().is_err());
        assert_eq!(config.etcd_endpoints.len(), 1);
        assert_eq!(config.registry_prefix, DEFAULT_REGISTRY_PREFIX);
    }
}
