//! Pool-level loop that keeps virtual IP assignments in line with the
//! declarations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shoal_coord::{path, Connection, ConnectionExt, CoordError, CoordResult, Watch};
use shoal_id::{HostId, PoolId};
use shoal_reconcile::{wait_for_shutdown, Listener};
use shoal_state::{delete_ip, get_ip, parse_ip_id, paths, IpRequest, VirtualIp};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::{AssignmentError, AssignmentHandler};
use crate::Config;

/// Children of `path` and a watch on them, or a watch for `path` to appear.
async fn watch_children(conn: &dyn Connection, path: &str) -> CoordResult<(Vec<String>, Watch)> {
    match conn.children_w(path).await {
        Err(CoordError::NoNode) => {
            let (_, watch) = conn.exists_w(path).await?;
            Ok((Vec::new(), watch))
        }
        other => other,
    }
}

/// Keeps the pool's declared virtual IPs assigned.
pub struct AssignmentListener {
    pool: PoolId,
    handler: Arc<dyn AssignmentHandler>,
    retry: Duration,
}

impl AssignmentListener {
    pub fn new(pool: PoolId, handler: Arc<dyn AssignmentHandler>, config: &Config) -> Self {
        Self {
            pool,
            handler,
            retry: config.scheduler_retry,
        }
    }

    /// One convergence pass. Returns false if anything should be retried.
    async fn reconcile(&self, conn: &dyn Connection, shutdown: &watch::Receiver<bool>, declared: Vec<String>) -> bool {
        let mut ok = true;

        let mut wanted: BTreeMap<String, VirtualIp> = BTreeMap::new();
        for name in declared {
            match conn.get::<VirtualIp>(&paths::virtual_ip(&self.pool, &name)).await {
                Ok(vip) => {
                    wanted.insert(vip.ip.clone(), vip);
                }
                Err(CoordError::NoNode) => {}
                Err(e) => {
                    warn!(ip = %name, error = %e, "Could not read virtual ip");
                    ok = false;
                }
            }
        }

        let assigned = match self.assignments(conn).await {
            Ok(assigned) => assigned,
            Err(e) => {
                warn!(error = %e, "Could not read ip assignments");
                return false;
            }
        };

        for (ip, vip) in &wanted {
            if assigned.contains_key(ip) {
                continue;
            }
            let result = self
                .handler
                .assign(&self.pool, ip, &vip.netmask, &vip.interface, shutdown.clone())
                .await;
            match result {
                Ok(host) => debug!(ip = %ip, host_id = %host, "Assigned virtual ip"),
                Err(AssignmentError::AlreadyAssigned { .. }) => {}
                Err(AssignmentError::Cancelled) => return false,
                Err(e) => {
                    warn!(ip = %ip, error = %e, "Could not assign virtual ip");
                    ok = false;
                }
            }
        }

        for ip in assigned.keys() {
            if wanted.contains_key(ip) {
                continue;
            }
            match self.handler.unassign(&self.pool, ip).await {
                Ok(host) => debug!(ip = %ip, host_id = %host, "Unassigned virtual ip"),
                Err(AssignmentError::NoAssignedHost(_)) => {}
                Err(e) => {
                    warn!(ip = %ip, error = %e, "Could not unassign virtual ip");
                    ok = false;
                }
            }
        }

        ok
    }

    /// Current bindings by address. Pool halves that lost their host half,
    /// for example when the host was removed, are deleted.
    async fn assignments(&self, conn: &dyn Connection) -> CoordResult<BTreeMap<String, HostId>> {
        let parent = paths::pool_ips(&self.pool);
        let ids = match conn.children(&parent).await {
            Ok(ids) => ids,
            Err(CoordError::NoNode) => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };

        let mut assigned = BTreeMap::new();
        for id in ids {
            let Some((host, ip)) = parse_ip_id(&id) else {
                warn!(ip_id = %id, "Deleting malformed ip id");
                match conn.delete(&path::join(&[&parent, &id])).await {
                    Ok(()) | Err(CoordError::NoNode) => {}
                    Err(e) => return Err(e),
                }
                continue;
            };

            let req = IpRequest::new(self.pool, host, ip.clone());
            match get_ip(conn, &req).await {
                Ok(_) => {
                    assigned.insert(ip, host);
                }
                Err(e) if e.is_not_found() => {
                    warn!(ip = %ip, host_id = %host, "Deleting orphaned ip");
                    if let Err(e) = delete_ip(conn, &req).await {
                        warn!(error = %e, "Could not delete orphaned ip");
                        assigned.insert(ip, host);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Could not read ip");
                    assigned.insert(ip, host);
                }
            }
        }
        Ok(assigned)
    }
}

#[async_trait]
impl Listener for AssignmentListener {
    #[instrument(skip_all, fields(pool_id = %self.pool))]
    async fn listen(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, conn: Arc<dyn Connection>) {
        info!("Virtual ip listener started");
        loop {
            let watched = async {
                let vips = watch_children(conn.as_ref(), &paths::virtual_ips(&self.pool)).await?;
                let (_, ips) = watch_children(conn.as_ref(), &paths::pool_ips(&self.pool)).await?;
                let (_, hosts) = watch_children(conn.as_ref(), &paths::hosts(&self.pool)).await?;
                CoordResult::Ok((vips, ips, hosts))
            };
            let ((declared, vip_watch), ip_watch, host_watch) = match watched.await {
                Ok(found) => found,
                Err(e) => {
                    warn!(error = %e, "Could not watch virtual ips");
                    break;
                }
            };

            let ok = self.reconcile(conn.as_ref(), &shutdown, declared).await;
            let retry = async {
                if ok {
                    std::future::pending::<()>().await;
                } else {
                    tokio::time::sleep(self.retry).await;
                }
            };

            tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut shutdown) => break,
                event = vip_watch.wait() => {
                    if event.is_session() {
                        break;
                    }
                }
                event = ip_watch.wait() => {
                    if event.is_session() {
                        break;
                    }
                }
                event = host_watch.wait() => {
                    if event.is_session() {
                        break;
                    }
                }
                _ = retry => debug!("Retrying virtual ip assignment"),
            }
        }
        info!("Virtual ip listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use shoal_coord::memory::MemoryStore;
    use shoal_state::{add_host, add_virtual_ip, get_pool_ips, register_online, remove_virtual_ip, HostNode};

    use super::*;
    use crate::virtualips::{OnlineHostProvider, StoreAssignmentHandler};

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_declared_ips_follow_declarations() {
        let store = MemoryStore::new();
        let conn: Arc<dyn Connection> = store.open_session("/").unwrap();
        let pool = PoolId::new();
        let host = HostId::new();
        add_host(conn.as_ref(), &HostNode::new(pool, host, "192.168.0.2")).await.unwrap();
        register_online(conn.as_ref(), &pool, &host).await.unwrap();

        let hosts = OnlineHostProvider::new(Arc::clone(&conn)).with_poll_interval(Duration::from_millis(10));
        let handler = StoreAssignmentHandler::new(Arc::clone(&conn), Arc::new(hosts), Duration::from_millis(1));
        let config = Config {
            scheduler_retry: Duration::from_millis(20),
            ..Config::default()
        };
        let listener = Arc::new(AssignmentListener::new(pool, Arc::new(handler), &config));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.listen(shutdown_rx, Arc::clone(&conn)));

        add_virtual_ip(conn.as_ref(), &pool, &VirtualIp::new("10.1.0.1", "255.255.0.0", "eth0"))
            .await
            .unwrap();
        eventually(|| async {
            let ips = get_pool_ips(conn.as_ref(), &pool).await.unwrap();
            ips.len() == 1 && ips[0].host_id == host && ips[0].host.interface == "eth0"
        })
        .await;

        remove_virtual_ip(conn.as_ref(), &pool, "10.1.0.1").await.unwrap();
        eventually(|| async { get_pool_ips(conn.as_ref(), &pool).await.unwrap().is_empty() }).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_orphaned_pool_half_is_cleaned() {
        let store = MemoryStore::new();
        let conn: Arc<dyn Connection> = store.open_session("/").unwrap();
        let pool = PoolId::new();
        let host = HostId::new();

        let req = IpRequest::new(pool, host, "10.1.0.9");
        shoal_state::create_ip(conn.as_ref(), &req, "", "").await.unwrap();
        conn.delete(&paths::host(&pool, &host)).await.unwrap();

        let handler = StoreAssignmentHandler::new(
            Arc::clone(&conn),
            Arc::new(OnlineHostProvider::new(Arc::clone(&conn))),
            Duration::from_secs(1),
        );
        let listener = AssignmentListener::new(pool, Arc::new(handler), &Config::default());
        let assigned = listener.assignments(conn.as_ref()).await.unwrap();
        assert!(assigned.is_empty());
        assert!(!conn.exists(&paths::pool_ip(&pool, &req.ip_id())).await.unwrap());
    }
}
