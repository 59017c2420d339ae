//! Host-side handler interfaces.
//!
//! The agent never talks to a container runtime or the network stack
//! directly. Each concern sits behind a narrow trait so the state machines
//! can be exercised with in-memory handlers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shoal_id::ServiceId;
use shoal_state::ServiceState;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Failure reported by a handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("start cancelled")]
    Cancelled,
}

/// Fires once when a container exits, carrying the exit time.
#[derive(Debug)]
pub struct ExitNotification {
    rx: oneshot::Receiver<DateTime<Utc>>,
}

impl ExitNotification {
    /// Creates a connected sender/notification pair.
    pub fn channel() -> (oneshot::Sender<DateTime<Utc>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Waits for the exit. A sender dropped without sending counts as an exit
    /// now.
    pub async fn exited(&mut self) -> DateTime<Utc> {
        (&mut self.rx).await.unwrap_or_else(|_| Utc::now())
    }
}

/// Drives the containers of scheduled instances.
#[async_trait]
pub trait ContainerHandler: Send + Sync {
    /// Attaches to the container recorded in `state`. `None` means the
    /// container is gone or no longer matches.
    async fn attach_container(
        &self,
        state: &ServiceState,
        service: &ServiceId,
        instance: u32,
    ) -> Result<Option<ExitNotification>, HandlerError>;

    /// Creates and starts a fresh container.
    async fn start_container(
        &self,
        cancel: watch::Receiver<bool>,
        service: &ServiceId,
        instance: u32,
    ) -> Result<(ServiceState, ExitNotification), HandlerError>;

    /// Pauses a running container. A missing container is not an error.
    async fn pause_container(&self, service: &ServiceId, instance: u32) -> Result<(), HandlerError>;

    /// Resumes a paused container. A missing container is not an error.
    async fn resume_container(&self, service: &ServiceId, instance: u32) -> Result<(), HandlerError>;

    /// Stops the container if one is running.
    async fn stop_container(&self, service: &ServiceId, instance: u32) -> Result<(), HandlerError>;
}

/// Adds and removes virtual IPs on the host's interfaces.
#[async_trait]
pub trait IpBindHandler: Send + Sync {
    /// Binds `ip`. Binding an address that is already bound succeeds.
    async fn bind_ip(&self, ip: &str, netmask: &str, interface: &str) -> Result<(), HandlerError>;

    /// Releases `ip`. Releasing an unbound address succeeds.
    async fn release_ip(&self, ip: &str) -> Result<(), HandlerError>;
}
