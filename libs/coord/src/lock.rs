//! Mutual exclusion and leader election over sequential ephemeral nodes.
//!
//! Each contender creates `{guid}-{kind}-{seq}` under the lock directory. The
//! lowest sequence number holds the lock. Every other contender watches only
//! the contender immediately below it and re-checks when that node goes away.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::path;
use crate::{Connection, ConnectionExt, CoordError, CoordResult, Node, Watch};

const LOCK_KIND: &str = "lock";

/// Parses `{guid}-{kind}-{seq}` lock node names.
///
/// Anything else in a lock directory (for example the directory of a
/// descendant resource) is not a contender.
pub(crate) fn parse_lock_name(name: &str) -> Option<(&str, &str, u64)> {
    let mut parts = name.split('-');
    let (guid, kind, seq) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    if guid.len() != 32 || !guid.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((guid, kind, seq.parse().ok()?))
}

pub(crate) fn new_guid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Waits until `blocker` yields no node, re-checking every time the node it
/// returned is deleted.
pub(crate) async fn wait_for_turn<F>(
    conn: &dyn Connection,
    dir: &str,
    own: &str,
    blocker: F,
) -> CoordResult<()>
where
    F: Fn(u64, &[(String, String, u64)]) -> Option<String> + Send + Sync,
{
    let (_, _, own_seq) = parse_lock_name(own).ok_or_else(|| CoordError::InvalidPath(own.into()))?;
    loop {
        let children = conn.children(dir).await?;
        let contenders: Vec<(String, String, u64)> = children
            .iter()
            .filter_map(|child| {
                parse_lock_name(child).map(|(_, kind, seq)| (child.clone(), kind.to_string(), seq))
            })
            .collect();

        if !contenders.iter().any(|(name, _, _)| name == own) {
            return Err(CoordError::NoNode);
        }

        let Some(prev) = blocker(own_seq, &contenders) else {
            return Ok(());
        };

        let prev_path = path::join(&[dir, &prev]);
        let (exists, watch) = conn.exists_w(&prev_path).await?;
        if exists {
            debug!(dir, own, waiting_on = %prev, "Waiting for lock predecessor");
            watch.wait().await;
        }
    }
}

/// The contender with the highest sequence below `own`.
pub(crate) fn next_lower<'a>(
    own: u64,
    contenders: impl Iterator<Item = &'a (String, String, u64)>,
) -> Option<String> {
    contenders
        .filter(|(_, _, seq)| *seq < own)
        .max_by_key(|(_, _, seq)| *seq)
        .map(|(name, _, _)| name.clone())
}

// =============================================================================
// Claim
// =============================================================================

/// One contender's node in a lock directory.
struct Claim {
    conn: Arc<dyn Connection>,
    dir: String,
    guid: String,
    node: Option<String>,
}

impl Claim {
    fn new(conn: Arc<dyn Connection>, dir: &str) -> Self {
        Self {
            conn,
            dir: dir.to_string(),
            guid: new_guid(),
            node: None,
        }
    }

    async fn acquire(&mut self, data: Vec<u8>) -> CoordResult<()> {
        if self.node.is_some() {
            return Err(CoordError::AlreadyLocked);
        }
        let prefix = path::join(&[&self.dir, &format!("{}-{LOCK_KIND}-", self.guid)]);
        let created = self.conn.create_ephemeral_raw(&prefix, data, true).await?;
        let name = path::base(&created).to_string();
        self.node = Some(name.clone());

        let waited = wait_for_turn(self.conn.as_ref(), &self.dir, &name, |own, contenders| {
            next_lower(own, contenders.iter())
        })
        .await;
        if let Err(e) = waited {
            let _ = self.release().await;
            return Err(e);
        }
        Ok(())
    }

    async fn release(&mut self) -> CoordResult<()> {
        let name = self.node.take().ok_or(CoordError::NotLocked)?;
        match self.conn.delete(&path::join(&[&self.dir, &name])).await {
            Ok(()) | Err(CoordError::NoNode) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn own_path(&self) -> Option<String> {
        self.node.as_ref().map(|n| path::join(&[&self.dir, n]))
    }
}

// =============================================================================
// Lock
// =============================================================================

/// Exclusive lock on a directory.
pub struct Lock {
    claim: Claim,
}

impl Lock {
    pub fn new(conn: Arc<dyn Connection>, dir: &str) -> Self {
        Self {
            claim: Claim::new(conn, dir),
        }
    }

    /// Blocks until the lock is held.
    pub async fn lock(&mut self) -> CoordResult<()> {
        self.claim.acquire(Vec::new()).await
    }

    pub async fn unlock(&mut self) -> CoordResult<()> {
        self.claim.release().await
    }

    pub fn is_locked(&self) -> bool {
        self.claim.node.is_some()
    }
}

// =============================================================================
// Leader
// =============================================================================

/// Leader election on a directory. The leader's payload is readable by
/// anyone through [`Leader::current`].
pub struct Leader<T> {
    claim: Claim,
    node: T,
}

impl<T: Node> Leader<T> {
    pub fn new(conn: Arc<dyn Connection>, dir: &str, node: T) -> Self {
        Self {
            claim: Claim::new(conn, dir),
            node,
        }
    }

    /// Blocks until this contender leads. The returned watch fires when the
    /// leader node goes away, which means leadership was lost.
    pub async fn take_lead(&mut self) -> CoordResult<Watch> {
        self.claim.acquire(self.node.encode()?).await?;
        let own = self.claim.own_path().ok_or(CoordError::NotLocked)?;
        let (exists, watch) = self.claim.conn.exists_w(&own).await?;
        if !exists {
            self.claim.node = None;
            return Err(CoordError::NoNode);
        }
        Ok(watch)
    }

    pub async fn release_lead(&mut self) -> CoordResult<()> {
        self.claim.release().await
    }

    /// Payload of whoever currently leads.
    pub async fn current(&self) -> CoordResult<T> {
        current_leader(self.claim.conn.as_ref(), &self.claim.dir).await
    }
}

/// Reads the payload of the lowest-sequence contender under `dir`.
pub async fn current_leader<T: Node>(conn: &dyn Connection, dir: &str) -> CoordResult<T> {
    let children = match conn.children(dir).await {
        Ok(children) => children,
        Err(CoordError::NoNode) => return Err(CoordError::NoLeaderFound),
        Err(e) => return Err(e),
    };
    let lowest = children
        .iter()
        .filter_map(|c| parse_lock_name(c).map(|(_, _, seq)| (seq, c)))
        .min_by_key(|(seq, _)| *seq)
        .map(|(_, c)| c.clone())
        .ok_or(CoordError::NoLeaderFound)?;
    match conn.get(&path::join(&[dir, &lowest])).await {
        Err(CoordError::NoNode) => Err(CoordError::NoLeaderFound),
        other => other,
    }
}

// =============================================================================
// Tests
// =============================================================================
