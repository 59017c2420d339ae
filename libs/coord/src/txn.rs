//! Accumulate-then-commit transactions.

use crate::{CoordError, CoordResult, Node, Version};

/// A single operation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
    },
    Set {
        path: String,
        data: Vec<u8>,
        version: Option<Version>,
    },
    Delete {
        path: String,
        version: Option<Version>,
    },
}

impl Op {
    pub fn path(&self) -> &str {
        match self {
            Op::Create { path, .. } | Op::Set { path, .. } | Op::Delete { path, .. } => path,
        }
    }
}

/// A batch of operations that commit atomically.
///
/// Builder calls never report per-operation results; the only outcome is
/// the one returned by [`crate::ConnectionExt::commit`]. An encoding failure
/// while building is held back and returned at commit.
#[derive(Debug, Default)]
#[must_use = "a transaction does nothing until committed"]
pub struct Transaction {
    ops: Vec<Op>,
    error: Option<CoordError>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `path` with the encoded node. The parent must already exist
    /// or be created earlier in the same transaction.
    pub fn create<T: Node>(&mut self, path: impl Into<String>, node: &T) -> &mut Self {
        if let Some(data) = self.encode(node) {
            self.ops.push(Op::Create {
                path: path.into(),
                data,
            });
        }
        self
    }

    /// Writes the node at `path`, checked against the version it carries.
    pub fn set<T: Node>(&mut self, path: impl Into<String>, node: &T) -> &mut Self {
        if let Some(data) = self.encode(node) {
            self.ops.push(Op::Set {
                path: path.into(),
                data,
                version: node.version(),
            });
        }
        self
    }

    /// Deletes a childless node at `path`.
    pub fn delete(&mut self, path: impl Into<String>) -> &mut Self {
        self.ops.push(Op::Delete {
            path: path.into(),
            version: None,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Releases the accumulated operations for a driver to apply.
    pub fn into_ops(self) -> CoordResult<Vec<Op>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.ops),
        }
    }

    fn encode<T: Node>(&mut self, node: &T) -> Option<Vec<u8>> {
        if self.error.is_some() {
            return None;
        }
        match node.encode() {
            Ok(data) => Some(data),
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dir;

    #[test]
    fn test_builder_accumulates_in_order() {
        let mut txn = Transaction::new();
        txn.create("/a", &Dir::default())
            .set("/b", &Dir::default())
            .delete("/c");
        assert_eq!(txn.len(), 3);

        let ops = txn.into_ops().unwrap();
        let paths: Vec<_> = ops.iter().map(Op::path).collect();
        assert_eq!(paths, vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn test_empty_transaction() {
        let txn = Transaction::new();
        assert!(txn.is_empty());
        assert!(txn.into_ops().unwrap().is_empty());
    }
}
