//! Connection registry.
//!
//! A registry owns the driver and caches one live connection per root path.
//! It is constructed explicitly and handed to the listeners that need it, so
//! separate registries (for example one per test) never share connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{path, Connection, CoordError, CoordResult};

/// Opens sessions against a concrete coordination store.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Opens a session whose paths are relative to `base`.
    async fn connect(&self, base: &str) -> CoordResult<Arc<dyn Connection>>;
}

/// Caches one connection per root path.
pub struct ConnectionRegistry {
    driver: Arc<dyn Driver>,
    connections: Mutex<HashMap<String, Arc<dyn Connection>>>,
    shut_down: AtomicBool,
}

impl ConnectionRegistry {
    /// Initializes an empty registry over `driver`.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            connections: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Returns the cached connection for `base`, dialing a new one if there
    /// is none or the cached one has closed.
    pub async fn get_connection(&self, base: &str) -> CoordResult<Arc<dyn Connection>> {
        path::validate(base)?;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(CoordError::ConnectionClosed);
        }

        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(base) {
            if !conn.is_closed() {
                return Ok(Arc::clone(conn));
            }
            debug!(base, "Dropping closed connection");
            connections.remove(base);
        }

        let conn = self.driver.connect(base).await?;
        connections.insert(base.to_string(), Arc::clone(&conn));
        info!(base, "Opened coordination connection");
        Ok(conn)
    }

    /// Closes every cached connection; later calls fail with
    /// `ConnectionClosed`.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        for (base, conn) in drained {
            conn.close().await;
            debug!(base = %base, "Closed coordination connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_connections_are_cached_per_base() {
        let registry = registry();
        let a = registry.get_connection("/pools/a").await.unwrap();
        let again = registry.get_connection("/pools/a").await.unwrap();
        let b = registry.get_connection("/pools/b").await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let registry = registry();
        let first = registry.get_connection("/").await.unwrap();
        first.close().await;
        let second = registry.get_connection("/").await.unwrap();
        assert!(!second.is_closed());
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_rejects() {
        let registry = registry();
        let conn = registry.get_connection("/").await.unwrap();
        registry.shutdown().await;
        assert!(conn.is_closed());
        assert!(matches!(
            registry.get_connection("/").await,
            Err(CoordError::ConnectionClosed)
        ));
    }
}
