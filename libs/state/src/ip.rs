//! Virtual IP bindings, paired like instance states: a pool half the
//! assigner owns and a host half the host agent watches.

use serde::{Deserialize, Serialize};
use shoal_coord::{impl_node, Connection, ConnectionExt, CoordError, CoordResult, Dir, Transaction, Version};
use shoal_id::{HostId, PoolId};
use tracing::{debug, warn};

use crate::paths;
use crate::{ErrorKind, IpError};

/// Node name for an IP bound to a host: `{host}-{ip}`.
pub fn ip_id(host: &HostId, ip: &str) -> String {
    format!("{host}-{ip}")
}

/// Splits an IP node name into its host and address. Host ids never contain
/// `-`, so everything after the first one is the address.
pub fn parse_ip_id(ip_id: &str) -> Option<(HostId, String)> {
    let (host, ip) = ip_id.split_once('-')?;
    if ip.is_empty() {
        return None;
    }
    let host = HostId::parse(host).ok()?;
    Some((host, ip.to_string()))
}

/// Identifies an IP binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpRequest {
    pub pool_id: PoolId,
    pub host_id: HostId,
    pub ip: String,
}

impl IpRequest {
    pub fn new(pool_id: PoolId, host_id: HostId, ip: impl Into<String>) -> Self {
        Self {
            pool_id,
            host_id,
            ip: ip.into(),
        }
    }

    pub fn ip_id(&self) -> String {
        ip_id(&self.host_id, &self.ip)
    }

    fn halves(&self) -> (String, String) {
        let id = self.ip_id();
        (
            paths::pool_ip(&self.pool_id, &id),
            paths::host_ip(&self.pool_id, &self.host_id, &id),
        )
    }
}

/// Pool half: `ok` is set once the host has bound the address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolIp {
    pub ok: bool,
    pub interface: String,
    pub netmask: String,
    #[serde(skip)]
    pub version: Option<Version>,
}

impl_node!(PoolIp);

/// Host half: what the host agent should bind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostIp {
    pub interface: String,
    pub netmask: String,
    #[serde(skip)]
    pub version: Option<Version>,
}

impl_node!(HostIp);

/// Both halves of a binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Ip {
    pub host_id: HostId,
    pub ip: String,
    pub pool: PoolIp,
    pub host: HostIp,
}

/// A virtual IP the pool should keep bound on some host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualIp {
    pub ip: String,
    pub netmask: String,
    pub interface: String,
    #[serde(skip)]
    pub version: Option<Version>,
}

impl_node!(VirtualIp);

impl VirtualIp {
    pub fn new(ip: impl Into<String>, netmask: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            netmask: netmask.into(),
            interface: interface.into(),
            version: None,
        }
    }
}

// =============================================================================
// CRUD
// =============================================================================

pub async fn get_ip(conn: &dyn Connection, req: &IpRequest) -> Result<Ip, IpError> {
    let (ppth, hpth) = req.halves();
    let pool: PoolIp = conn.get(&ppth).await.map_err(|e| {
        debug!(path = %ppth, error = %e, "Could not look up ip on pool");
        IpError::new("get", req, e)
    })?;
    let host: HostIp = conn.get(&hpth).await.map_err(|e| {
        debug!(path = %hpth, error = %e, "Could not look up ip on host");
        IpError::new("get", req, e)
    })?;
    Ok(Ip {
        host_id: req.host_id,
        ip: req.ip.clone(),
        pool,
        host,
    })
}

/// Assigns an IP to a host. The pool half starts out not `ok`.
pub async fn create_ip(
    conn: &dyn Connection,
    req: &IpRequest,
    netmask: &str,
    interface: &str,
) -> Result<(), IpError> {
    for parent in [
        paths::pool_ips(&req.pool_id),
        paths::host_ips(&req.pool_id, &req.host_id),
    ] {
        conn.create_if_absent(&parent, &mut Dir::default())
            .await
            .map_err(|e| {
                debug!(path = %parent, error = %e, "Could not initialize ip path");
                IpError::new("create", req, e)
            })?;
    }

    let (ppth, hpth) = req.halves();
    let pool = PoolIp {
        ok: false,
        interface: interface.to_string(),
        netmask: netmask.to_string(),
        version: None,
    };
    let host = HostIp {
        interface: interface.to_string(),
        netmask: netmask.to_string(),
        version: None,
    };

    let mut txn = Transaction::new();
    txn.create(ppth, &pool).create(hpth, &host);
    conn.commit(txn)
        .await
        .map_err(|e| IpError::new("create", req, e))?;
    debug!(ip = %req.ip, host_id = %req.host_id, "Created ip");
    Ok(())
}

/// Applies `mutate` to both halves and writes them back at the versions
/// read. Nothing is written when `mutate` returns `false`.
pub async fn update_ip<F>(conn: &dyn Connection, req: &IpRequest, mutate: F) -> Result<(), IpError>
where
    F: FnOnce(&mut Ip) -> bool + Send,
{
    let mut ip = get_ip(conn, req)
        .await
        .map_err(|e| IpError { op: "update", ..e })?;
    let versions = (ip.pool.version, ip.host.version);
    if !mutate(&mut ip) {
        return Ok(());
    }
    (ip.pool.version, ip.host.version) = versions;

    let (ppth, hpth) = req.halves();
    let mut txn = Transaction::new();
    txn.set(ppth, &ip.pool).set(hpth, &ip.host);
    conn.commit(txn)
        .await
        .map_err(|e| IpError::new("update", req, e))?;
    debug!(ip = %req.ip, host_id = %req.host_id, "Updated ip");
    Ok(())
}

/// Deletes whichever halves exist.
pub async fn delete_ip(conn: &dyn Connection, req: &IpRequest) -> Result<(), IpError> {
    let (ppth, hpth) = req.halves();
    let mut txn = Transaction::new();
    for path in [ppth, hpth] {
        let exists = conn
            .exists(&path)
            .await
            .map_err(|e| IpError::new("delete", req, e))?;
        if exists {
            txn.delete(path);
        }
    }
    conn.commit(txn)
        .await
        .map_err(|e| IpError::new("delete", req, e))?;
    debug!(ip = %req.ip, host_id = %req.host_id, "Deleted ip");
    Ok(())
}

// =============================================================================
// Declarations
// =============================================================================

/// Declares a virtual IP for the pool. Declaring it again replaces it.
pub async fn add_virtual_ip(conn: &dyn Connection, pool: &PoolId, vip: &VirtualIp) -> CoordResult<()> {
    let path = paths::virtual_ip(pool, &vip.ip);
    let mut node = vip.clone();
    node.version = None;
    match conn.create(&path, &mut node).await {
        Err(CoordError::NodeExists) => conn.set(&path, &mut node).await,
        other => other,
    }
}

/// Withdraws a virtual IP declaration. Withdrawing a missing one succeeds.
pub async fn remove_virtual_ip(conn: &dyn Connection, pool: &PoolId, ip: &str) -> CoordResult<()> {
    match conn.delete(&paths::virtual_ip(pool, ip)).await {
        Ok(()) | Err(CoordError::NoNode) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Makes the pool's declarations match `vips`.
pub async fn sync_virtual_ips(conn: &dyn Connection, pool: &PoolId, vips: &[VirtualIp]) -> CoordResult<()> {
    for vip in vips {
        add_virtual_ip(conn, pool, vip).await?;
    }
    let declared = match conn.children(&paths::virtual_ips(pool)).await {
        Ok(children) => children,
        Err(CoordError::NoNode) => return Ok(()),
        Err(e) => return Err(e),
    };
    for ip in declared {
        if !vips.iter().any(|v| v.ip == ip) {
            remove_virtual_ip(conn, pool, &ip).await?;
        }
    }
    Ok(())
}

// =============================================================================
// Projections
// =============================================================================

async fn load_ips(conn: &dyn Connection, pool: &PoolId, ids: Vec<(HostId, String)>) -> CoordResult<Vec<Ip>> {
    let mut ips = Vec::new();
    for (host_id, ip) in ids {
        let req = IpRequest::new(*pool, host_id, ip);
        match get_ip(conn, &req).await {
            Ok(found) => ips.push(found),
            Err(e) if e.is_not_found() => debug!(ip_id = %req.ip_id(), "Skipping orphaned ip"),
            Err(IpError {
                kind: ErrorKind::Store(inner),
                ..
            }) if inner.is_connection_lost() || inner == CoordError::NoServer => {
                return Err(inner);
            }
            Err(e) => warn!(error = %e, "Skipping unreadable ip"),
        }
    }
    Ok(ips)
}

async fn list_ip_ids(conn: &dyn Connection, parent: &str) -> CoordResult<Vec<(HostId, String)>> {
    let children = match conn.children(parent).await {
        Ok(children) => children,
        Err(CoordError::NoNode) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(children
        .iter()
        .filter_map(|id| {
            let parsed = parse_ip_id(id);
            if parsed.is_none() {
                debug!(ip_id = %id, "Skipping malformed ip id");
            }
            parsed
        })
        .collect())
}

/// Complete bindings assigned to a host.
pub async fn get_host_ips(conn: &dyn Connection, pool: &PoolId, host: &HostId) -> CoordResult<Vec<Ip>> {
    let ids = list_ip_ids(conn, &paths::host_ips(pool, host)).await?;
    let ids: Vec<_> = ids.into_iter().filter(|(h, _)| h == host).collect();
    load_ips(conn, pool, ids).await
}

/// Complete bindings across the pool.
pub async fn get_pool_ips(conn: &dyn Connection, pool: &PoolId) -> CoordResult<Vec<Ip>> {
    let ids = list_ip_ids(conn, &paths::pool_ips(pool)).await?;
    load_ips(conn, pool, ids).await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;
    use shoal_coord::memory::MemoryStore;

    use super::*;

    fn setup() -> (Arc<dyn Connection>, IpRequest) {
        let store = MemoryStore::new();
        let conn: Arc<dyn Connection> = store.open_session("/").unwrap();
        (conn, IpRequest::new(PoolId::new(), HostId::new(), "10.0.0.50"))
    }

    #[test]
    fn test_ip_id_parses_back() {
        let host = HostId::new();
        assert_eq!(parse_ip_id(&ip_id(&host, "10.0.0.1")), Some((host, "10.0.0.1".to_string())));
        assert_eq!(parse_ip_id(&ip_id(&host, "fe80::1")), Some((host, "fe80::1".to_string())));
    }

    #[rstest]
    #[case::no_separator("10.0.0.1")]
    #[case::bad_host("svc_01HV4Z4NYPLTRS0JTUA8XDME5F-10.0.0.1")]
    #[case::no_ip("host_01HV4Z3MXNKPQR9HSTZ7WCLD4E-")]
    fn test_parse_ip_id_rejects(#[case] id: &str) {
        assert_eq!(parse_ip_id(id), None);
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let (conn, req) = setup();
        create_ip(conn.as_ref(), &req, "255.255.255.0", "eth0").await.unwrap();

        let ip = get_ip(conn.as_ref(), &req).await.unwrap();
        assert!(!ip.pool.ok);
        assert_eq!(ip.host.interface, "eth0");

        update_ip(conn.as_ref(), &req, |ip| {
            ip.pool.ok = true;
            true
        })
        .await
        .unwrap();
        assert!(get_ip(conn.as_ref(), &req).await.unwrap().pool.ok);

        let err = create_ip(conn.as_ref(), &req, "", "").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);

        delete_ip(conn.as_ref(), &req).await.unwrap();
        assert!(get_ip(conn.as_ref(), &req).await.unwrap_err().is_not_found());
        delete_ip(conn.as_ref(), &req).await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_virtual_ips() {
        let (conn, req) = setup();
        let pool = req.pool_id;
        add_virtual_ip(conn.as_ref(), &pool, &VirtualIp::new("10.0.1.1", "255.255.255.0", "eth0"))
            .await
            .unwrap();
        add_virtual_ip(conn.as_ref(), &pool, &VirtualIp::new("10.0.1.2", "255.255.255.0", "eth0"))
            .await
            .unwrap();

        let replaced = VirtualIp::new("10.0.1.2", "255.255.0.0", "eth1");
        sync_virtual_ips(conn.as_ref(), &pool, &[replaced.clone()]).await.unwrap();

        let declared = conn.children(&paths::virtual_ips(&pool)).await.unwrap();
        assert_eq!(declared, vec!["10.0.1.2".to_string()]);
        let stored: VirtualIp = conn.get(&paths::virtual_ip(&pool, "10.0.1.2")).await.unwrap();
        assert_eq!(stored.interface, "eth1");

        remove_virtual_ip(conn.as_ref(), &pool, "10.0.1.2").await.unwrap();
        remove_virtual_ip(conn.as_ref(), &pool, "10.0.1.2").await.unwrap();
    }

    #[tokio::test]
    async fn test_projections() {
        let (conn, req) = setup();
        let other = IpRequest::new(req.pool_id, HostId::new(), "10.0.0.51");
        create_ip(conn.as_ref(), &req, "", "").await.unwrap();
        create_ip(conn.as_ref(), &other, "", "").await.unwrap();

        // A pool half without its host half is skipped.
        let (_, hpth) = other.halves();
        conn.delete(&hpth).await.unwrap();

        let pool_ips = get_pool_ips(conn.as_ref(), &req.pool_id).await.unwrap();
        assert_eq!(pool_ips.len(), 1);
        assert_eq!(pool_ips[0].ip, req.ip);

        let host_ips = get_host_ips(conn.as_ref(), &req.pool_id, &req.host_id).await.unwrap();
        assert_eq!(host_ips.len(), 1);
        assert!(get_host_ips(conn.as_ref(), &req.pool_id, &other.host_id)
            .await
            .unwrap()
            .is_empty());
    }
}
