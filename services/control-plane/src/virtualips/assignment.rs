//! Assigning and unassigning virtual IPs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use shoal_coord::{Connection, CoordError};
use shoal_id::{HostId, PoolId};
use shoal_reconcile::ExclusionWindow;
use shoal_state::{create_ip, delete_ip, parse_ip_id, paths, IpRequest};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use super::{AssignmentError, HostProvider};

/// Binds virtual IPs to hosts and takes them back.
#[async_trait]
pub trait AssignmentHandler: Send + Sync {
    /// Assigns `ip` to a host and returns the host chosen.
    async fn assign(
        &self,
        pool: &PoolId,
        ip: &str,
        netmask: &str,
        interface: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<HostId, AssignmentError>;

    /// Removes the assignment of `ip` and returns the host that held it.
    async fn unassign(&self, pool: &PoolId, ip: &str) -> Result<HostId, AssignmentError>;
}

/// Records assignments as IP bindings in the store.
///
/// A host that was just given an address is not picked for the same address
/// again until the exclusion window passes, so a host that cannot bind it
/// does not get it back immediately.
pub struct StoreAssignmentHandler {
    conn: Arc<dyn Connection>,
    hosts: Arc<dyn HostProvider>,
    exclusions: Mutex<ExclusionWindow<(String, HostId)>>,
}

impl StoreAssignmentHandler {
    pub fn new(conn: Arc<dyn Connection>, hosts: Arc<dyn HostProvider>, exclusion: Duration) -> Self {
        Self {
            conn,
            hosts,
            exclusions: Mutex::new(ExclusionWindow::new(exclusion)),
        }
    }

    async fn assigned_host(&self, pool: &PoolId, ip: &str) -> Result<Option<HostId>, AssignmentError> {
        let ids = match self.conn.children(&paths::pool_ips(pool)).await {
            Ok(ids) => ids,
            Err(CoordError::NoNode) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| parse_ip_id(id))
            .find_map(|(host, bound)| (bound == ip).then_some(host)))
    }
}

#[async_trait]
impl AssignmentHandler for StoreAssignmentHandler {
    async fn assign(
        &self,
        pool: &PoolId,
        ip: &str,
        netmask: &str,
        interface: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<HostId, AssignmentError> {
        if let Some(host) = self.assigned_host(pool, ip).await? {
            return Err(AssignmentError::AlreadyAssigned {
                ip: ip.to_string(),
                host,
            });
        }

        let mut exclusions = self.exclusions.lock().await;
        exclusions.prune();

        let hosts = self.hosts.registered_hosts(cancel, pool).await?;
        debug!(ip, count = hosts.len(), "Found hosts");
        let candidates: Vec<HostId> = hosts
            .into_iter()
            .filter(|host| !exclusions.is_excluded(&(ip.to_string(), *host)))
            .collect();
        let picked = candidates.choose(&mut rand::rng()).copied();
        let Some(host) = picked else {
            return Err(AssignmentError::NoHosts);
        };

        exclusions.record((ip.to_string(), host));
        create_ip(self.conn.as_ref(), &IpRequest::new(*pool, host, ip), netmask, interface).await?;
        info!(ip, host_id = %host, "Assigned ip");
        Ok(host)
    }

    async fn unassign(&self, pool: &PoolId, ip: &str) -> Result<HostId, AssignmentError> {
        let host = self
            .assigned_host(pool, ip)
            .await?
            .ok_or_else(|| AssignmentError::NoAssignedHost(ip.to_string()))?;
        delete_ip(self.conn.as_ref(), &IpRequest::new(*pool, host, ip)).await?;
        info!(ip, host_id = %host, "Unassigned ip");
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use shoal_coord::memory::MemoryStore;
    use shoal_state::get_ip;

    use super::*;

    /// Hands out a fixed host list.
    struct FixedHosts(Vec<HostId>);

    #[async_trait]
    impl HostProvider for FixedHosts {
        async fn registered_hosts(
            &self,
            _cancel: watch::Receiver<bool>,
            _pool: &PoolId,
        ) -> Result<Vec<HostId>, AssignmentError> {
            Ok(self.0.clone())
        }
    }

    fn handler(hosts: Vec<HostId>) -> (Arc<dyn Connection>, StoreAssignmentHandler) {
        let store = MemoryStore::new();
        let conn: Arc<dyn Connection> = store.open_session("/").unwrap();
        let handler = StoreAssignmentHandler::new(
            Arc::clone(&conn),
            Arc::new(FixedHosts(hosts)),
            Duration::from_secs(60),
        );
        (conn, handler)
    }

    #[tokio::test]
    async fn test_assign_then_unassign() {
        let host = HostId::new();
        let (conn, handler) = handler(vec![host]);
        let pool = PoolId::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let chosen = handler
            .assign(&pool, "10.0.0.5", "255.255.255.0", "eth0", cancel_rx.clone())
            .await
            .unwrap();
        assert_eq!(chosen, host);
        let ip = get_ip(conn.as_ref(), &IpRequest::new(pool, host, "10.0.0.5")).await.unwrap();
        assert_eq!(ip.host.netmask, "255.255.255.0");

        let err = handler
            .assign(&pool, "10.0.0.5", "", "", cancel_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, AssignmentError::AlreadyAssigned { host: h, .. } if h == host));

        assert_eq!(handler.unassign(&pool, "10.0.0.5").await.unwrap(), host);
        let err = handler.unassign(&pool, "10.0.0.5").await.unwrap_err();
        assert!(matches!(err, AssignmentError::NoAssignedHost(_)));
    }

    #[tokio::test]
    async fn test_recently_assigned_host_is_excluded() {
        let hosts = vec![HostId::new(), HostId::new()];
        let (_conn, handler) = handler(hosts.clone());
        let pool = PoolId::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let mut chosen = HashSet::new();
        for _ in 0..2 {
            let host = handler
                .assign(&pool, "10.0.0.7", "", "", cancel_rx.clone())
                .await
                .unwrap();
            chosen.insert(host);
            handler.unassign(&pool, "10.0.0.7").await.unwrap();
        }
        assert_eq!(chosen.len(), 2);

        let err = handler
            .assign(&pool, "10.0.0.7", "", "", cancel_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, AssignmentError::NoHosts));
    }
}
