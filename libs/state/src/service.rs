//! Service records and the desired-state operations on them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shoal_coord::{impl_node, Connection, ConnectionExt, CoordError, CoordResult, Lock, Version};
use shoal_id::{PoolId, ServiceId};
use tracing::{debug, info, warn};

use crate::paths;
use crate::{delete_service_states, DesiredState};

/// Attempts at a read-modify-write before a version conflict is returned.
const MODIFY_ATTEMPTS: usize = 5;

/// Scheduling behaviors a service can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOption {
    /// Any change to the instance count restarts every instance.
    RestartAllOnInstanceChanged,
    /// Instance 0 must be running for any other instance to run.
    RestartAllOnInstanceZeroDown,
}

/// A service as the scheduler sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub id: ServiceId,
    pub name: String,
    pub pool_id: PoolId,
    pub instances: u32,
    #[serde(default)]
    pub desired_state: DesiredState,
    #[serde(default)]
    pub change_options: Vec<ChangeOption>,
    #[serde(default)]
    pub should_have_address_assignment: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub image_id: String,
    #[serde(skip)]
    pub version: Option<Version>,
}

impl_node!(ServiceNode);

impl ServiceNode {
    pub fn new(pool_id: PoolId, name: impl Into<String>, instances: u32) -> Self {
        Self {
            id: ServiceId::new(),
            name: name.into(),
            pool_id,
            instances,
            desired_state: DesiredState::Run,
            change_options: Vec::new(),
            should_have_address_assignment: false,
            locked: false,
            image_id: String::new(),
            version: None,
        }
    }

    pub fn has_option(&self, option: ChangeOption) -> bool {
        self.change_options.contains(&option)
    }
}

pub async fn get_service(
    conn: &dyn Connection,
    pool: &PoolId,
    service: &ServiceId,
) -> CoordResult<ServiceNode> {
    conn.get(&paths::service(pool, service)).await
}

/// Creates or replaces a service. An existing `locked` flag is kept; on
/// create the flag is taken from `node`.
pub async fn update_service(conn: &dyn Connection, node: &ServiceNode) -> CoordResult<()> {
    let path = paths::service(&node.pool_id, &node.id);
    for _ in 0..MODIFY_ATTEMPTS {
        let mut next = node.clone();
        let result = match conn.get::<ServiceNode>(&path).await {
            Ok(existing) => {
                next.locked = existing.locked;
                next.version = existing.version;
                conn.set(&path, &mut next).await
            }
            Err(CoordError::NoNode) => {
                next.version = None;
                conn.create(&path, &mut next).await
            }
            Err(e) => return Err(e),
        };
        match result {
            Ok(()) => {
                debug!(service_id = %node.id, "Updated service");
                return Ok(());
            }
            Err(CoordError::BadVersion | CoordError::NodeExists) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(CoordError::BadVersion)
}

/// Reads a service, applies `mutate` and writes it back at the version read.
async fn modify_service<F>(
    conn: &dyn Connection,
    pool: &PoolId,
    service: &ServiceId,
    mutate: F,
) -> CoordResult<()>
where
    F: Fn(&mut ServiceNode) + Send + Sync,
{
    let path = paths::service(pool, service);
    for _ in 0..MODIFY_ATTEMPTS {
        let mut node: ServiceNode = conn.get(&path).await?;
        mutate(&mut node);
        match conn.set(&path, &mut node).await {
            Err(CoordError::BadVersion) => continue,
            other => return other,
        }
    }
    Err(CoordError::BadVersion)
}

pub async fn set_service_lock(
    conn: &dyn Connection,
    pool: &PoolId,
    service: &ServiceId,
    locked: bool,
) -> CoordResult<()> {
    modify_service(conn, pool, service, |n| n.locked = locked).await
}

pub async fn start_service(
    conn: &dyn Connection,
    pool: &PoolId,
    service: &ServiceId,
) -> CoordResult<()> {
    modify_service(conn, pool, service, |n| n.desired_state = DesiredState::Run).await
}

pub async fn stop_service(
    conn: &dyn Connection,
    pool: &PoolId,
    service: &ServiceId,
) -> CoordResult<()> {
    modify_service(conn, pool, service, |n| n.desired_state = DesiredState::Stop).await
}

pub async fn pause_service(
    conn: &dyn Connection,
    pool: &PoolId,
    service: &ServiceId,
) -> CoordResult<()> {
    modify_service(conn, pool, service, |n| n.desired_state = DesiredState::Pause).await
}

/// Deletes a service's instance states and then the service itself.
/// Removing a missing service succeeds.
pub async fn remove_service(
    conn: &dyn Connection,
    pool: &PoolId,
    service: &ServiceId,
) -> CoordResult<()> {
    let count = delete_service_states(conn, pool, service).await;
    match conn.delete(&paths::service(pool, service)).await {
        Ok(()) | Err(CoordError::NoNode) => {
            info!(service_id = %service, states = count, "Removed service");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Makes the pool's services match `nodes`: listed services are created or
/// updated, the rest are removed.
pub async fn sync_services(
    conn: &dyn Connection,
    pool: &PoolId,
    nodes: &[ServiceNode],
) -> CoordResult<()> {
    for node in nodes {
        update_service(conn, node).await?;
    }

    let existing = match conn.children(&paths::services(pool)).await {
        Ok(children) => children,
        Err(CoordError::NoNode) => return Ok(()),
        Err(e) => return Err(e),
    };
    for child in existing {
        let Ok(id) = ServiceId::parse(&child) else {
            continue;
        };
        if !nodes.iter().any(|n| n.id == id) {
            remove_service(conn, pool, &id).await?;
        }
    }
    Ok(())
}

// =============================================================================
// Bulk Locking
// =============================================================================

/// Sets `locked` on every named service while holding the pool's service
/// maintenance lock.
pub async fn lock_services(
    conn: Arc<dyn Connection>,
    pool: &PoolId,
    services: &[ServiceId],
) -> CoordResult<()> {
    set_locks(conn, pool, services, true).await
}

/// Clears `locked` on every named service while holding the pool's service
/// maintenance lock.
pub async fn unlock_services(
    conn: Arc<dyn Connection>,
    pool: &PoolId,
    services: &[ServiceId],
) -> CoordResult<()> {
    set_locks(conn, pool, services, false).await
}

async fn set_locks(
    conn: Arc<dyn Connection>,
    pool: &PoolId,
    services: &[ServiceId],
    locked: bool,
) -> CoordResult<()> {
    let mut lock = Lock::new(Arc::clone(&conn), &paths::service_lock(pool));
    lock.lock().await?;

    let mut result = Ok(());
    for service in services {
        match set_service_lock(conn.as_ref(), pool, service, locked).await {
            Ok(()) => {}
            Err(CoordError::NoNode) => debug!(service_id = %service, "Service is gone"),
            Err(e) => {
                warn!(service_id = %service, error = %e, "Could not set service lock");
                result = Err(e);
                break;
            }
        }
    }

    lock.unlock().await?;
    debug!(count = services.len(), locked, "Set service locks");
    result
}

// =============================================================================
// Tests
// =============================================================================
