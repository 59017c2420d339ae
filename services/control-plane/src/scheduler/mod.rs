//! Service scheduling.
//!
//! One [`ServiceListener`] task runs per service node under
//! `/pools/{pool}/services`. Each pass reads the service and its scheduled
//! instances and converges them:
//!
//! - `Run`: resume paused instances, then add or stop instances to match the
//!   instance count
//! - `Pause`: pause running instances
//! - `Stop`: stop every instance
//!
//! Placement is delegated to a [`HostSelector`].

mod listener;

use async_trait::async_trait;
use shoal_coord::CoordError;
use shoal_id::HostId;
use shoal_state::{ServiceNode, StateError};
use thiserror::Error;

pub use listener::{missing_instance_ids, ServiceListener};

/// Failure reported by a placement callback.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("no eligible hosts")]
    NoEligibleHosts,

    #[error("{0}")]
    Other(String),
}

/// Picks the host a new instance of a service should run on.
#[async_trait]
pub trait HostSelector: Send + Sync {
    async fn select_host(&self, service: &ServiceNode) -> Result<HostId, HandlerError>;
}

/// Why a single scheduling step failed.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("store error: {0}")]
    Store(#[from] CoordError),

    #[error("host selection failed: {0}")]
    Selection(#[from] HandlerError),

    #[error("host {0} is offline")]
    HostOffline(HostId),

    #[error("host {0} is not accepting instances")]
    HostLocked(HostId),
}
