//! Coordination-store error taxonomy.

use thiserror::Error;

/// Result alias for coordination-store calls.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors surfaced by a coordination-store connection and the recipes built
/// on it.
///
/// `NoNode` is a routine outcome: callers are expected to branch on it rather
/// than treat it as a failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordError {
    #[error("node does not exist")]
    NoNode,

    #[error("node already exists")]
    NodeExists,

    #[error("version conflict")]
    BadVersion,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("ephemeral nodes cannot have children")]
    NoChildrenForEphemerals,

    #[error("node has children")]
    NotEmpty,

    #[error("no server available")]
    NoServer,

    #[error("node has no data")]
    EmptyNode,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("no leader found")]
    NoLeaderFound,

    #[error("lock is not held")]
    NotLocked,

    #[error("lock is already held")]
    AlreadyLocked,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoordError {
    /// Returns true if the node was missing.
    pub fn is_no_node(&self) -> bool {
        matches!(self, Self::NoNode)
    }

    /// Returns true if the node already existed.
    pub fn is_node_exists(&self) -> bool {
        matches!(self, Self::NodeExists)
    }

    /// Returns true if the session behind the connection is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
