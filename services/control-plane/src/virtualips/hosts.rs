//! Candidate hosts for a virtual IP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shoal_coord::{Connection, CoordError};
use shoal_id::{HostId, PoolId};
use shoal_reconcile::wait_for_shutdown;
use shoal_state::{is_host_online, paths};
use tokio::sync::watch;
use tracing::debug;

use super::AssignmentError;

/// Lists the hosts that may take an assignment.
#[async_trait]
pub trait HostProvider: Send + Sync {
    /// Blocks until at least one host is available or `cancel` fires.
    async fn registered_hosts(
        &self,
        cancel: watch::Receiver<bool>,
        pool: &PoolId,
    ) -> Result<Vec<HostId>, AssignmentError>;
}

/// Hosts with a live agent.
pub struct OnlineHostProvider {
    conn: Arc<dyn Connection>,
    poll: Duration,
}

impl OnlineHostProvider {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            conn,
            poll: Duration::from_secs(1),
        }
    }

    /// Online markers come and go without touching the host list, so the
    /// list is also re-read on this interval.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }
}

#[async_trait]
impl HostProvider for OnlineHostProvider {
    async fn registered_hosts(
        &self,
        mut cancel: watch::Receiver<bool>,
        pool: &PoolId,
    ) -> Result<Vec<HostId>, AssignmentError> {
        let path = paths::hosts(pool);
        loop {
            let (children, watch) = match self.conn.children_w(&path).await {
                Ok(found) => found,
                Err(CoordError::NoNode) => {
                    let (_, watch) = self.conn.exists_w(&path).await?;
                    (Vec::new(), watch)
                }
                Err(e) => return Err(e.into()),
            };

            let mut online = Vec::new();
            for child in children {
                let Ok(host) = HostId::parse(&child) else {
                    continue;
                };
                if is_host_online(self.conn.as_ref(), pool, &host).await? {
                    online.push(host);
                }
            }
            if !online.is_empty() {
                return Ok(online);
            }

            debug!(pool_id = %pool, "Waiting for online hosts");
            tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut cancel) => return Err(AssignmentError::Cancelled),
                _ = watch.wait() => {}
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use shoal_coord::memory::MemoryStore;
    use shoal_state::{add_host, register_online, HostNode};

    use super::*;

    #[tokio::test]
    async fn test_waits_for_an_online_host() {
        let store = MemoryStore::new();
        let conn: Arc<dyn Connection> = store.open_session("/").unwrap();
        let pool = PoolId::new();
        let offline = HostNode::new(pool, HostId::new(), "");
        add_host(conn.as_ref(), &offline).await.unwrap();

        let provider = OnlineHostProvider::new(Arc::clone(&conn)).with_poll_interval(Duration::from_millis(10));
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let waiting = tokio::spawn(async move { provider.registered_hosts(cancel_rx, &pool).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiting.is_finished());

        let online = HostId::new();
        add_host(conn.as_ref(), &HostNode::new(pool, online, "")).await.unwrap();
        register_online(conn.as_ref(), &pool, &online).await.unwrap();

        let hosts = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(hosts, vec![online]);
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting() {
        let store = MemoryStore::new();
        let conn: Arc<dyn Connection> = store.open_session("/").unwrap();
        let provider = OnlineHostProvider::new(conn);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let err = provider.registered_hosts(cancel_rx, &PoolId::new()).await.unwrap_err();
        assert!(matches!(err, AssignmentError::Cancelled));
    }
}
