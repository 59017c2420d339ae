//! Host records, the online marker and host removal.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shoal_coord::{
    impl_node, Connection, ConnectionExt, CoordError, CoordResult, Dir, Lock, Transaction, Version,
};
use shoal_id::{HostId, PoolId};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::paths;
use crate::{clean_host_states, get_host_state_ids, update_state, DesiredState};

/// A host registered with a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostNode {
    pub id: HostId,
    pub pool_id: PoolId,
    #[serde(default)]
    pub ip_addr: String,
    #[serde(skip)]
    pub version: Option<Version>,
}

impl_node!(HostNode);

impl HostNode {
    pub fn new(pool_id: PoolId, id: HostId, ip_addr: impl Into<String>) -> Self {
        Self {
            id,
            pool_id,
            ip_addr: ip_addr.into(),
            version: None,
        }
    }
}

/// Registers a host. Adding a host that already exists does nothing.
pub async fn add_host(conn: &dyn Connection, host: &HostNode) -> CoordResult<()> {
    let path = paths::host(&host.pool_id, &host.id);
    let mut node = host.clone();
    node.version = None;
    conn.create_if_absent(&path, &mut node).await?;
    debug!(host_id = %host.id, "Added host");
    Ok(())
}

/// Overwrites a host record.
pub async fn update_host(conn: &dyn Connection, host: &HostNode) -> CoordResult<()> {
    let path = paths::host(&host.pool_id, &host.id);
    let mut node = host.clone();
    node.version = None;
    conn.set(&path, &mut node).await?;
    debug!(host_id = %host.id, "Updated host");
    Ok(())
}

pub async fn get_host(conn: &dyn Connection, pool: &PoolId, host: &HostId) -> CoordResult<HostNode> {
    conn.get(&paths::host(pool, host)).await
}

/// Every readable host record in the pool.
pub async fn get_hosts(conn: &dyn Connection, pool: &PoolId) -> CoordResult<Vec<HostNode>> {
    let children = match conn.children(&paths::hosts(pool)).await {
        Ok(children) => children,
        Err(CoordError::NoNode) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut hosts = Vec::with_capacity(children.len());
    for child in children {
        let Ok(id) = HostId::parse(&child) else {
            continue;
        };
        match get_host(conn, pool, &id).await {
            Ok(host) => hosts.push(host),
            Err(CoordError::NoNode | CoordError::EmptyNode) => {}
            Err(CoordError::Serialization(e)) => {
                warn!(host_id = %id, error = %e, "Skipping unreadable host");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(hosts)
}

/// Makes the pool's hosts match `hosts`: listed hosts are added or updated,
/// the rest are removed.
pub async fn sync_hosts(
    cancel: watch::Receiver<bool>,
    conn: Arc<dyn Connection>,
    pool: &PoolId,
    hosts: &[HostNode],
) -> CoordResult<()> {
    for host in hosts {
        let path = paths::host(pool, &host.id);
        if conn.exists(&path).await? {
            update_host(conn.as_ref(), host).await?;
        } else {
            add_host(conn.as_ref(), host).await?;
        }
    }

    let existing = match conn.children(&paths::hosts(pool)).await {
        Ok(children) => children,
        Err(CoordError::NoNode) => return Ok(()),
        Err(e) => return Err(e),
    };
    for child in existing {
        let Ok(id) = HostId::parse(&child) else {
            continue;
        };
        if !hosts.iter().any(|h| h.id == id) {
            remove_host(cancel.clone(), Arc::clone(&conn), pool, &id).await?;
        }
    }
    Ok(())
}

/// Drains a host and deletes it.
///
/// The host's scheduling lock is held for the duration so no new instances
/// land on it. Every instance on the host is set to `Stop`, then this waits
/// until the host agent has removed them all. Cancelling stops the wait and
/// leaves the host in place.
#[instrument(skip_all, fields(pool_id = %pool, host_id = %host))]
pub async fn remove_host(
    mut cancel: watch::Receiver<bool>,
    conn: Arc<dyn Connection>,
    pool: &PoolId,
    host: &HostId,
) -> CoordResult<()> {
    let path = paths::host(pool, host);
    if !conn.exists(&path).await? {
        debug!("Host already removed");
        return Ok(());
    }

    let mut lock = Lock::new(Arc::clone(&conn), &paths::host_lock(pool, host));
    lock.lock().await?;
    let result = match drain_host(&mut cancel, conn.as_ref(), pool, host).await {
        Ok(true) => delete_host_tree(conn.as_ref(), &path).await,
        Ok(false) => {
            info!("Host removal cancelled");
            Ok(())
        }
        Err(e) => Err(e),
    };

    // The lock node goes away with the host subtree.
    lock.unlock().await?;
    result
}

async fn delete_host_tree(conn: &dyn Connection, path: &str) -> CoordResult<()> {
    let mut txn = Transaction::new();
    conn.delete_subtree(&mut txn, path).await?;
    conn.commit(txn).await?;
    info!("Removed host");
    Ok(())
}

/// Stops every instance on the host and waits for the list to empty.
/// Returns `false` if cancelled first.
async fn drain_host(
    cancel: &mut watch::Receiver<bool>,
    conn: &dyn Connection,
    pool: &PoolId,
    host: &HostId,
) -> CoordResult<bool> {
    let instances = paths::host_instances(pool, host);
    loop {
        clean_host_states(conn, pool, host).await?;

        let (children, watch) = match conn.children_w(&instances).await {
            Ok(found) => found,
            Err(CoordError::NoNode) => return Ok(true),
            Err(e) => return Err(e),
        };
        if children.is_empty() {
            return Ok(true);
        }

        for req in get_host_state_ids(conn, pool, host).await? {
            let stopped = update_state(conn, &req, |s| {
                if s.host.desired_state == DesiredState::Stop {
                    return false;
                }
                s.host.desired_state = DesiredState::Stop;
                true
            })
            .await;
            if let Err(e) = stopped {
                if !e.is_not_found() {
                    warn!(error = %e, "Could not stop instance on host");
                }
            }
        }
        debug!(remaining = children.len(), "Waiting for host instances to stop");

        tokio::select! {
            biased;

            _ = cancel.wait_for(|stop| *stop) => return Ok(false),
            _ = watch.wait() => {}
        }
    }
}

// =============================================================================
// Online Marker
// =============================================================================

/// Registers the calling session as the host's live agent and returns the
/// marker's path. The marker disappears with the session.
pub async fn register_online(
    conn: &dyn Connection,
    pool: &PoolId,
    host: &HostId,
) -> CoordResult<String> {
    let prefix = shoal_coord::path::join(&[&paths::host_online(pool, host), "session-"]);
    let marker = conn.create_ephemeral_sequential(&prefix, &Dir::default()).await?;
    debug!(host_id = %host, marker = %marker, "Host is online");
    Ok(marker)
}

pub async fn unregister_online(conn: &dyn Connection, marker: &str) -> CoordResult<()> {
    match conn.delete(marker).await {
        Ok(()) | Err(CoordError::NoNode) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Returns true if any agent session has the host marked online.
pub async fn is_host_online(conn: &dyn Connection, pool: &PoolId, host: &HostId) -> CoordResult<bool> {
    match conn.children(&paths::host_online(pool, host)).await {
        Ok(markers) => Ok(!markers.is_empty()),
        Err(CoordError::NoNode) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Returns true while someone holds the host's scheduling lock.
pub async fn is_host_locked(conn: &dyn Connection, pool: &PoolId, host: &HostId) -> CoordResult<bool> {
    match conn.children(&paths::host_lock(pool, host)).await {
        Ok(holders) => Ok(!holders.is_empty()),
        Err(CoordError::NoNode) => Ok(false),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Tests
// =============================================================================
