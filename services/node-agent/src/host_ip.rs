//! Virtual IP bindings on this host.
//!
//! One task runs for every IP assigned to the host. It binds the address,
//! marks the pool half `ok` and holds the binding until either half goes
//! away. A task cancelled by its supervisor keeps the address bound and
//! parks it in the passive set; the next session either picks it up again
//! or releases it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use shoal_coord::{path, Connection, ConnectionExt, CoordError};
use shoal_id::{HostId, PoolId};
use shoal_reconcile::{listen, wait_for_shutdown, ConnectionSlot, Listener, Spawner};
use shoal_state::{delete_ip, ip_id, parse_ip_id, paths, update_ip, HostIp, IpRequest};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::handler::IpBindHandler;

/// Keeps the host's assigned virtual IPs bound.
pub struct HostIpListener {
    pool: PoolId,
    host: HostId,
    handler: Arc<dyn IpBindHandler>,
    conn: ConnectionSlot,
    /// IP ids that are bound but have no task.
    passive: Mutex<HashSet<String>>,
}

impl HostIpListener {
    /// `binds` are addresses already bound on the host, for instance by a
    /// previous agent process. They are released unless still assigned.
    pub fn new(pool: PoolId, host: HostId, handler: Arc<dyn IpBindHandler>, binds: &[String]) -> Self {
        let passive = binds.iter().map(|ip| ip_id(&host, ip)).collect();
        Self {
            pool,
            host,
            handler,
            conn: ConnectionSlot::default(),
            passive: Mutex::new(passive),
        }
    }

    /// IP ids bound without a task.
    pub fn passive(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.passive_set().iter().cloned().collect();
        ids.sort();
        ids
    }

    fn passive_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.passive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(skip(self, cancel, conn), fields(host_id = %self.host))]
    async fn run(&self, cancel: &mut watch::Receiver<bool>, conn: &dyn Connection, id: &str) {
        let ip = match parse_ip_id(id) {
            Some((host, ip)) if host == self.host => ip,
            _ => {
                warn!("Deleting invalid ip id");
                match conn.delete(&path::join(&[&self.path(), id])).await {
                    Ok(()) | Err(CoordError::NoNode) => {}
                    Err(e) => warn!(error = %e, "Could not delete invalid ip id"),
                }
                return;
            }
        };
        let req = IpRequest::new(self.pool, self.host, ip);

        self.passive_set().remove(id);
        let ppth = paths::pool_ip(&self.pool, id);
        match conn.exists(&ppth).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Pool ip is missing");
                self.release(conn, &req).await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "Could not check pool ip");
                self.passive_set().insert(id.to_string());
                return;
            }
        }

        let hpth = paths::host_ip(&self.pool, &self.host, id);
        loop {
            let (host_ip, host_watch) = match conn.get_w::<HostIp>(&hpth).await {
                Ok(found) => found,
                Err(CoordError::NoNode) => {
                    debug!("Host ip was removed");
                    self.release(conn, &req).await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Could not watch host ip, detaching");
                    self.passive_set().insert(id.to_string());
                    return;
                }
            };

            let pool_watch = match conn.exists_w(&ppth).await {
                Ok((true, watch)) => watch,
                Ok((false, _)) => {
                    debug!("Pool ip was removed");
                    self.release(conn, &req).await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Could not watch pool ip, detaching");
                    self.passive_set().insert(id.to_string());
                    return;
                }
            };

            if let Err(e) = self
                .handler
                .bind_ip(&req.ip, &host_ip.netmask, &host_ip.interface)
                .await
            {
                warn!(error = %e, "Could not bind virtual ip");
                self.release(conn, &req).await;
                return;
            }

            let marked = update_ip(conn, &req, |ip| {
                if ip.pool.ok {
                    return false;
                }
                ip.pool.ok = true;
                true
            })
            .await;
            if let Err(e) = marked {
                warn!(error = %e, "Could not mark ip bound, detaching");
                self.passive_set().insert(id.to_string());
                return;
            }

            let detach = tokio::select! {
                biased;

                _ = wait_for_shutdown(cancel) => true,
                event = host_watch.wait() => event.is_session(),
                event = pool_watch.wait() => event.is_session(),
            };
            if detach || *cancel.borrow() {
                debug!("Listener shut down, detaching");
                self.passive_set().insert(id.to_string());
                return;
            }
        }
    }

    /// Drops the binding and both records.
    async fn release(&self, conn: &dyn Connection, req: &IpRequest) {
        info!(ip = %req.ip, "Releasing ip binding");
        if let Err(e) = self.handler.release_ip(&req.ip).await {
            warn!(ip = %req.ip, error = %e, "Could not release ip binding");
        }
        if let Err(e) = delete_ip(conn, req).await {
            warn!(ip = %req.ip, error = %e, "Could not delete ip");
        }
    }
}

#[async_trait]
impl Spawner for HostIpListener {
    fn set_connection(&self, conn: Arc<dyn Connection>) {
        self.conn.set(conn);
    }

    fn path(&self) -> String {
        paths::host_ips(&self.pool, &self.host)
    }

    async fn spawn(&self, mut cancel: watch::Receiver<bool>, child: String) {
        let conn = match self.conn.get() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(ip_id = %child, error = %e, "No connection for ip");
                return;
            }
        };
        self.run(&mut cancel, conn.as_ref(), &child).await;
    }

    /// Releases passive addresses that are no longer assigned here.
    async fn post(&self, active: &HashSet<String>) {
        let Ok(conn) = self.conn.get() else {
            return;
        };
        if conn.is_closed() {
            return;
        }

        let orphaned: Vec<String> = {
            let mut passive = self.passive_set();
            let ids: Vec<String> = passive.iter().filter(|id| !active.contains(*id)).cloned().collect();
            for id in &ids {
                passive.remove(id);
            }
            ids
        };

        for id in orphaned {
            match parse_ip_id(&id) {
                Some((host, ip)) => self.release(conn.as_ref(), &IpRequest::new(self.pool, host, ip)).await,
                None => debug!(ip_id = %id, "Dropping malformed passive ip"),
            }
        }
    }
}

#[async_trait]
impl Listener for HostIpListener {
    async fn listen(self: Arc<Self>, shutdown: watch::Receiver<bool>, conn: Arc<dyn Connection>) {
        listen(shutdown, conn, Arc::clone(&self)).await;
    }
}
