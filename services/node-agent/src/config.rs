//! Configuration for the node agent.

use std::time::Duration;

use anyhow::{Context, Result};
use shoal_id::{HostId, PoolId};
use shoal_reconcile::RetryPolicy;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host this agent manages.
    pub host_id: HostId,

    /// Pool the host belongs to.
    pub pool_id: PoolId,

    /// Retries for recording a container exit while the store is unreachable.
    pub terminate_retry: RetryPolicy,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_id: HostId::new(),
            pool_id: PoolId::new(),
            terminate_retry: RetryPolicy {
                limit: 5,
                delay: Duration::from_secs(1),
            },
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Ids can be provided or generated
        let host_id = match std::env::var("SHOAL_HOST_ID") {
            Ok(raw) => HostId::parse(&raw).context("SHOAL_HOST_ID is not a host id")?,
            Err(_) => HostId::new(),
        };
        let pool_id = match std::env::var("SHOAL_POOL_ID") {
            Ok(raw) => PoolId::parse(&raw).context("SHOAL_POOL_ID is not a pool id")?,
            Err(_) => PoolId::new(),
        };

        let limit = std::env::var("SHOAL_TERMINATE_RETRY_LIMIT")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .context("SHOAL_TERMINATE_RETRY_LIMIT")?;
        let delay = Duration::from_millis(
            std::env::var("SHOAL_TERMINATE_RETRY_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("SHOAL_TERMINATE_RETRY_MS")?,
        );

        let log_level = std::env::var("SHOAL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            host_id,
            pool_id,
            terminate_retry: RetryPolicy { limit, delay },
            log_level,
        })
    }
}
