//! Reader/writer lock on a hierarchical resource path.
//!
//! Lock files for `/a/b` live in `/rwlocks/a/b`, named `{guid}-read-{seq}` or
//! `{guid}-write-{seq}`. The directory of a descendant resource (`/rwlocks/a/b/c`)
//! shares the parent directory but is not a lock file, so locks on a path and
//! on its descendants never block each other.

use std::sync::Arc;

use tracing::debug;

use crate::lock::{new_guid, next_lower, wait_for_turn};
use crate::path;
use crate::{Connection, CoordError, CoordResult};

const LOCK_ROOT: &str = "/rwlocks";
const READ: &str = "read";
const WRITE: &str = "write";

/// Reader/writer lock for one resource path.
pub struct RwLock {
    conn: Arc<dyn Connection>,
    dir: String,
    guid: String,
    node: Option<String>,
}

impl RwLock {
    pub fn new(conn: Arc<dyn Connection>, resource: &str) -> Self {
        Self {
            conn,
            dir: path::join(&[LOCK_ROOT, resource]),
            guid: new_guid(),
            node: None,
        }
    }

    /// Blocks until no lower write lock is held.
    pub async fn read_lock(&mut self) -> CoordResult<()> {
        self.acquire(READ).await
    }

    /// Blocks until no lower lock of either kind is held.
    pub async fn write_lock(&mut self) -> CoordResult<()> {
        self.acquire(WRITE).await
    }

    pub async fn unlock(&mut self) -> CoordResult<()> {
        let name = self.node.take().ok_or(CoordError::NotLocked)?;
        match self.conn.delete(&path::join(&[&self.dir, &name])).await {
            Ok(()) | Err(CoordError::NoNode) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.node.is_some()
    }

    async fn acquire(&mut self, kind: &'static str) -> CoordResult<()> {
        if self.node.is_some() {
            return Err(CoordError::AlreadyLocked);
        }
        let prefix = path::join(&[&self.dir, &format!("{}-{kind}-", self.guid)]);
        let created = self.conn.create_ephemeral_raw(&prefix, Vec::new(), true).await?;
        let name = path::base(&created).to_string();
        self.node = Some(name.clone());
        debug!(dir = %self.dir, node = %name, kind, "Requested rwlock");

        let waited = wait_for_turn(self.conn.as_ref(), &self.dir, &name, move |own, contenders| {
            if kind == WRITE {
                next_lower(own, contenders.iter())
            } else {
                next_lower(own, contenders.iter().filter(|(_, k, _)| k == WRITE))
            }
        })
        .await;
        if let Err(e) = waited {
            let _ = self.unlock().await;
            return Err(e);
        }
        Ok(())
    }
}
