//! The connection contract every coordination-store driver implements.

use async_trait::async_trait;

use crate::node::decode;
use crate::{CoordError, CoordResult, Dir, Node, Op, Transaction, Version, Watch};

// =============================================================================
// Driver Contract
// =============================================================================

/// A session against the coordination store.
///
/// Paths are absolute and relative to the root the connection was opened at.
/// Implementations must deliver each watch at least once after a relevant
/// change, apply [`Connection::multi`] atomically, and remove ephemeral nodes
/// when the session ends.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Creates a node, creating missing parents as empty directories.
    async fn create_raw(&self, path: &str, data: Vec<u8>) -> CoordResult<Version>;

    /// Creates an ephemeral node bound to this session and returns its path.
    ///
    /// With `sequential` the store appends a zero-padded counter to `path`.
    async fn create_ephemeral_raw(
        &self,
        path: &str,
        data: Vec<u8>,
        sequential: bool,
    ) -> CoordResult<String>;

    async fn get_raw(&self, path: &str) -> CoordResult<(Vec<u8>, Version)>;

    async fn get_w_raw(&self, path: &str) -> CoordResult<(Vec<u8>, Version, Watch)>;

    /// Writes a node; `None` skips the version check.
    async fn set_raw(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<Version>,
    ) -> CoordResult<Version>;

    /// Deletes a node together with everything below it.
    async fn delete(&self, path: &str) -> CoordResult<()>;

    async fn exists(&self, path: &str) -> CoordResult<bool>;

    async fn exists_w(&self, path: &str) -> CoordResult<(bool, Watch)>;

    async fn children(&self, path: &str) -> CoordResult<Vec<String>>;

    async fn children_w(&self, path: &str) -> CoordResult<(Vec<String>, Watch)>;

    /// Applies every operation or none of them.
    async fn multi(&self, ops: Vec<Op>) -> CoordResult<()>;

    /// Ends the session.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

// =============================================================================
// Typed Helpers
// =============================================================================

/// Typed node access on top of any [`Connection`].
#[async_trait]
pub trait ConnectionExt: Connection {
    /// Creates `path` holding `node` and records the new version on it.
    async fn create<T: Node>(&self, path: &str, node: &mut T) -> CoordResult<()> {
        let version = self.create_raw(path, node.encode()?).await?;
        node.set_version(Some(version));
        Ok(())
    }

    /// Creates an empty directory node.
    async fn create_dir(&self, path: &str) -> CoordResult<()> {
        self.create_raw(path, Vec::new()).await.map(|_| ())
    }

    /// Creates `path` unless something is already there.
    async fn create_if_absent<T: Node>(&self, path: &str, node: &mut T) -> CoordResult<()> {
        match self.create(path, node).await {
            Err(CoordError::NodeExists) => Ok(()),
            other => other,
        }
    }

    /// Makes sure every component of `path` exists.
    async fn ensure_path(&self, path: &str) -> CoordResult<()> {
        if self.exists(path).await? {
            return Ok(());
        }
        self.create_if_absent(path, &mut Dir::default()).await
    }

    async fn create_ephemeral<T: Node>(&self, path: &str, node: &T) -> CoordResult<String> {
        self.create_ephemeral_raw(path, node.encode()?, false).await
    }

    /// Creates a sequential ephemeral node under `prefix` and returns its path.
    async fn create_ephemeral_sequential<T: Node>(
        &self,
        prefix: &str,
        node: &T,
    ) -> CoordResult<String> {
        self.create_ephemeral_raw(prefix, node.encode()?, true).await
    }

    async fn get<T: Node>(&self, path: &str) -> CoordResult<T> {
        let (data, version) = self.get_raw(path).await?;
        decode(&data, version)
    }

    async fn get_w<T: Node>(&self, path: &str) -> CoordResult<(T, Watch)> {
        let (data, version, watch) = self.get_w_raw(path).await?;
        Ok((decode(&data, version)?, watch))
    }

    /// Writes `node`, checked against the version it was read at.
    async fn set<T: Node>(&self, path: &str, node: &mut T) -> CoordResult<()> {
        let version = self.set_raw(path, node.encode()?, node.version()).await?;
        node.set_version(Some(version));
        Ok(())
    }

    /// Commits a transaction.
    async fn commit(&self, txn: Transaction) -> CoordResult<()> {
        let ops = txn.into_ops()?;
        if ops.is_empty() {
            return Ok(());
        }
        self.multi(ops).await
    }

    /// Lists `path` and all of its descendants, deepest first.
    ///
    /// Traversal uses an explicit stack, so tree depth is not bounded by the
    /// call stack. A missing `path` yields an empty list.
    async fn subtree(&self, path: &str) -> CoordResult<Vec<String>> {
        let mut pending = vec![path.to_string()];
        let mut visited = Vec::new();
        while let Some(current) = pending.pop() {
            let children = match self.children(&current).await {
                Ok(children) => children,
                Err(CoordError::NoNode) => continue,
                Err(e) => return Err(e),
            };
            for child in children {
                pending.push(crate::path::join(&[&current, &child]));
            }
            visited.push(current);
        }
        // Parents are visited before their children, so reversing puts every
        // node after all of its descendants.
        visited.reverse();
        Ok(visited)
    }

    /// Deletes `path` and its descendants inside `txn`.
    async fn delete_subtree(&self, txn: &mut Transaction, path: &str) -> CoordResult<()> {
        for node in self.subtree(path).await? {
            txn.delete(node);
        }
        Ok(())
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}
