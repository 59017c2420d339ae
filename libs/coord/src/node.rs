//! Stored node payloads and their version tokens.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::CoordResult;

/// Optimistic-concurrency token for a stored node.
///
/// A node read from the store carries the version it was read at; writing it
/// back with that version fails with `BadVersion` if anyone wrote in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {
    /// Creates a version from the store's raw counter.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the store's raw counter.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A payload that can be stored at a path.
///
/// The version is carried alongside the payload but never serialized into it.
pub trait Node: Serialize + DeserializeOwned + Send + Sync {
    /// The version this node was last read or written at.
    fn version(&self) -> Option<Version>;

    /// Records the version reported by the store.
    fn set_version(&mut self, version: Option<Version>);

    /// Encodes the payload for storage.
    fn encode(&self) -> CoordResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Implements [`Node`] for a struct with a `version: Option<Version>` field.
#[macro_export]
macro_rules! impl_node {
    ($name:ty) => {
        impl $crate::Node for $name {
            fn version(&self) -> Option<$crate::Version> {
                self.version
            }

            fn set_version(&mut self, version: Option<$crate::Version>) {
                self.version = version;
            }
        }
    };
}

/// An empty directory node.
///
/// Directories are stored with no data, so they can be created but not read
/// back as a payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dir {
    #[serde(skip)]
    version: Option<Version>,
}

impl Node for Dir {
    fn version(&self) -> Option<Version> {
        self.version
    }

    fn set_version(&mut self, version: Option<Version>) {
        self.version = version;
    }

    fn encode(&self) -> CoordResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Decodes a stored payload, rejecting directory nodes.
pub(crate) fn decode<T: Node>(data: &[u8], version: crate::Version) -> CoordResult<T> {
    if data.is_empty() {
        return Err(crate::CoordError::EmptyNode);
    }
    let mut node: T = serde_json::from_slice(data)?;
    node.set_version(Some(version));
    Ok(node)
}
