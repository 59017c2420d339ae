//! Store paths for pool-scoped records.

use shoal_coord::path::join;
use shoal_id::{HostId, PoolId, ServiceId};

pub fn pool(pool: &PoolId) -> String {
    join(&["/pools", &pool.to_string()])
}

// =============================================================================
// Services
// =============================================================================

pub fn services(pool: &PoolId) -> String {
    join(&[&self::pool(pool), "services"])
}

pub fn service(pool: &PoolId, service: &ServiceId) -> String {
    join(&[&services(pool), &service.to_string()])
}

/// Service half of an instance state.
pub fn service_instance(pool: &PoolId, service: &ServiceId, state_id: &str) -> String {
    join(&[&self::service(pool, service), state_id])
}

/// Lock directory for bulk service maintenance.
pub fn service_lock(pool: &PoolId) -> String {
    join(&[&self::pool(pool), "locks", "services"])
}

// =============================================================================
// Hosts
// =============================================================================

pub fn hosts(pool: &PoolId) -> String {
    join(&[&self::pool(pool), "hosts"])
}

pub fn host(pool: &PoolId, host: &HostId) -> String {
    join(&[&hosts(pool), &host.to_string()])
}

pub fn host_instances(pool: &PoolId, host: &HostId) -> String {
    join(&[&self::host(pool, host), "instances"])
}

/// Host half of an instance state.
pub fn host_instance(pool: &PoolId, host: &HostId, state_id: &str) -> String {
    join(&[&host_instances(pool, host), state_id])
}

/// Parent of the host's ephemeral online markers.
pub fn host_online(pool: &PoolId, host: &HostId) -> String {
    join(&[&self::host(pool, host), "online"])
}

/// Lock directory that keeps new instances off a host.
pub fn host_lock(pool: &PoolId, host: &HostId) -> String {
    join(&[&self::host(pool, host), "locked"])
}

pub fn host_ips(pool: &PoolId, host: &HostId) -> String {
    join(&[&self::host(pool, host), "ips"])
}

pub fn host_ip(pool: &PoolId, host: &HostId, ip_id: &str) -> String {
    join(&[&host_ips(pool, host), ip_id])
}

// =============================================================================
// IPs
// =============================================================================

pub fn pool_ips(pool: &PoolId) -> String {
    join(&[&self::pool(pool), "ips"])
}

pub fn pool_ip(pool: &PoolId, ip_id: &str) -> String {
    join(&[&pool_ips(pool), ip_id])
}

/// Virtual IP declarations for the pool.
pub fn virtual_ips(pool: &PoolId) -> String {
    join(&[&self::pool(pool), "virtualips"])
}

pub fn virtual_ip(pool: &PoolId, ip: &str) -> String {
    join(&[&virtual_ips(pool), ip])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_halves_share_state_id() {
        let pool = PoolId::new();
        let host = HostId::new();
        let svc = ServiceId::new();
        let sid = format!("{host}-{svc}-0");

        assert_eq!(
            host_instance(&pool, &host, &sid),
            format!("/pools/{pool}/hosts/{host}/instances/{sid}")
        );
        assert_eq!(
            service_instance(&pool, &svc, &sid),
            format!("/pools/{pool}/services/{svc}/{sid}")
        );
    }

    #[test]
    fn test_lock_paths() {
        let pool = PoolId::new();
        let host = HostId::new();
        assert_eq!(service_lock(&pool), format!("/pools/{pool}/locks/services"));
        assert_eq!(host_lock(&pool, &host), format!("/pools/{pool}/hosts/{host}/locked"));
    }
}
