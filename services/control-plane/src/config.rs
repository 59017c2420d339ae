//! Configuration for the control plane.

use std::time::Duration;

use anyhow::{Context, Result};
use shoal_id::PoolId;
use shoal_reconcile::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub pool_id: PoolId,
    /// Delay before a failed service pass is run again.
    pub scheduler_retry: Duration,
    /// Retries for a stop that loses a version race or finds no server.
    pub stop_retry: RetryPolicy,
    /// How long a host is skipped for an IP it was just given.
    pub vip_exclusion: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_id: PoolId::new(),
            scheduler_retry: Duration::from_secs(1),
            stop_retry: RetryPolicy {
                limit: 3,
                delay: Duration::from_secs(1),
            },
            vip_exclusion: Duration::from_secs(10),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let pool_id = match std::env::var("SHOAL_POOL_ID") {
            Ok(raw) => PoolId::parse(&raw).context("SHOAL_POOL_ID is not a pool id")?,
            Err(_) => PoolId::new(),
        };

        let scheduler_retry = Duration::from_millis(
            std::env::var("SHOAL_SCHEDULER_RETRY_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("SHOAL_SCHEDULER_RETRY_MS")?,
        );

        let stop_retry_limit = std::env::var("SHOAL_STOP_RETRY_LIMIT")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .context("SHOAL_STOP_RETRY_LIMIT")?;

        let vip_exclusion = Duration::from_secs(
            std::env::var("SHOAL_VIP_EXCLUSION_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("SHOAL_VIP_EXCLUSION_SECS")?,
        );

        let log_level = std::env::var("SHOAL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            pool_id,
            scheduler_retry,
            stop_retry: RetryPolicy {
                limit: stop_retry_limit,
                delay: scheduler_retry,
            },
            vip_exclusion,
            log_level,
        })
    }
}
