//! In-process coordination store.
//!
//! [`MemoryStore`] holds one tree shared by any number of sessions. Each
//! [`MemoryConnection`] is a session: its ephemeral nodes disappear and its
//! outstanding watches fire with [`EventKind::Session`] when it is closed.
//! Transactions are staged on a copy of the tree and swapped in only if every
//! operation succeeds.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::path;
use crate::{
    Connection, CoordError, CoordResult, Driver, Event, EventKind, Op, Version, Watch,
    WatchTrigger,
};

// =============================================================================
// Tree
// =============================================================================

#[derive(Debug, Clone, Default)]
struct Entry {
    data: Vec<u8>,
    version: u64,
    owner: Option<u64>,
    children: BTreeSet<String>,
    next_seq: u64,
}

type Nodes = HashMap<String, Entry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Data,
    Children,
}

struct Notice {
    slot: Slot,
    path: String,
    kind: EventKind,
}

impl Notice {
    fn new(slot: Slot, path: &str, kind: EventKind) -> Self {
        Self {
            slot,
            path: path.to_string(),
            kind,
        }
    }
}

struct Registration {
    session: u64,
    base: String,
    trigger: WatchTrigger,
}

type Firing = (Registration, EventKind, String);

struct Tree {
    nodes: Nodes,
    data_watches: HashMap<String, Vec<Registration>>,
    child_watches: HashMap<String, Vec<Registration>>,
    open_sessions: HashSet<u64>,
    next_session: u64,
    faults: VecDeque<CoordError>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = Nodes::new();
        nodes.insert("/".to_string(), Entry::default());
        Self {
            nodes,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            open_sessions: HashSet::new(),
            next_session: 1,
            faults: VecDeque::new(),
        }
    }

    fn watches(&mut self, slot: Slot) -> &mut HashMap<String, Vec<Registration>> {
        match slot {
            Slot::Data => &mut self.data_watches,
            Slot::Children => &mut self.child_watches,
        }
    }

    fn register(&mut self, slot: Slot, abs: &str, session: u64, base: &str) -> Watch {
        let (trigger, watch) = Watch::channel(relative(base, abs));
        let regs = self.watches(slot).entry(abs.to_string()).or_default();
        regs.retain(|r| !r.trigger.is_disarmed());
        regs.push(Registration {
            session,
            base: base.to_string(),
            trigger,
        });
        watch
    }

    fn collect(&mut self, notices: Vec<Notice>) -> Vec<Firing> {
        let mut firing = Vec::new();
        for notice in notices {
            if let Some(regs) = self.watches(notice.slot).remove(&notice.path) {
                for reg in regs {
                    firing.push((reg, notice.kind, notice.path.clone()));
                }
            }
        }
        firing
    }
}

fn fire(firing: Vec<Firing>) {
    for (reg, kind, abs) in firing {
        let rel = relative(&reg.base, &abs);
        reg.trigger.fire(Event::new(kind, rel));
    }
}

fn relative(base: &str, abs: &str) -> String {
    if base == "/" {
        return abs.to_string();
    }
    match abs.strip_prefix(base) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => abs.to_string(),
    }
}

fn create_node(
    nodes: &mut Nodes,
    path: &str,
    data: Vec<u8>,
    owner: Option<u64>,
    sequential: bool,
    notices: &mut Vec<Notice>,
) -> CoordResult<(String, u64)> {
    let parent_path = path::parent(path).ok_or(CoordError::NodeExists)?;
    let parent = nodes.get(parent_path).ok_or(CoordError::NoNode)?;
    if parent.owner.is_some() {
        return Err(CoordError::NoChildrenForEphemerals);
    }

    let full = if sequential {
        format!("{path}{:010}", parent.next_seq)
    } else {
        path.to_string()
    };
    if nodes.contains_key(&full) {
        return Err(CoordError::NodeExists);
    }

    nodes.insert(
        full.clone(),
        Entry {
            data,
            owner,
            ..Entry::default()
        },
    );
    if let Some(parent) = nodes.get_mut(parent_path) {
        parent.children.insert(path::base(&full).to_string());
        if sequential {
            parent.next_seq += 1;
        }
    }

    notices.push(Notice::new(Slot::Data, &full, EventKind::Created));
    notices.push(Notice::new(Slot::Children, parent_path, EventKind::ChildrenChanged));
    Ok((full, 0))
}

fn ensure_parents(nodes: &mut Nodes, path: &str, notices: &mut Vec<Notice>) -> CoordResult<()> {
    let mut missing = Vec::new();
    let mut current = path::parent(path);
    while let Some(p) = current {
        if nodes.contains_key(p) {
            break;
        }
        missing.push(p.to_string());
        current = path::parent(p);
    }
    for p in missing.iter().rev() {
        create_node(nodes, p, Vec::new(), None, false, notices)?;
    }
    Ok(())
}

fn set_node(
    nodes: &mut Nodes,
    path: &str,
    data: Vec<u8>,
    version: Option<Version>,
    notices: &mut Vec<Notice>,
) -> CoordResult<u64> {
    let entry = nodes.get_mut(path).ok_or(CoordError::NoNode)?;
    if version.is_some_and(|v| v.value() != entry.version) {
        return Err(CoordError::BadVersion);
    }
    entry.data = data;
    entry.version += 1;
    notices.push(Notice::new(Slot::Data, path, EventKind::DataChanged));
    Ok(entry.version)
}

fn delete_node(
    nodes: &mut Nodes,
    path: &str,
    version: Option<Version>,
    notices: &mut Vec<Notice>,
) -> CoordResult<()> {
    let parent_path = path::parent(path).ok_or_else(|| CoordError::InvalidPath(path.into()))?;
    let entry = nodes.get(path).ok_or(CoordError::NoNode)?;
    if version.is_some_and(|v| v.value() != entry.version) {
        return Err(CoordError::BadVersion);
    }
    if !entry.children.is_empty() {
        return Err(CoordError::NotEmpty);
    }
    nodes.remove(path);
    if let Some(parent) = nodes.get_mut(parent_path) {
        parent.children.remove(path::base(path));
    }
    notices.push(Notice::new(Slot::Data, path, EventKind::Deleted));
    notices.push(Notice::new(Slot::Children, path, EventKind::Deleted));
    notices.push(Notice::new(Slot::Children, parent_path, EventKind::ChildrenChanged));
    Ok(())
}

fn delete_tree(nodes: &mut Nodes, path: &str, notices: &mut Vec<Notice>) -> CoordResult<()> {
    if !nodes.contains_key(path) {
        return Err(CoordError::NoNode);
    }
    let mut pending = vec![path.to_string()];
    let mut order = Vec::new();
    while let Some(current) = pending.pop() {
        if let Some(entry) = nodes.get(&current) {
            for child in &entry.children {
                pending.push(path::join(&[&current, child]));
            }
        }
        order.push(current);
    }
    for node in order.iter().rev() {
        delete_node(nodes, node, None, notices)?;
    }
    Ok(())
}

// =============================================================================
// Store
// =============================================================================

/// Shared in-process tree.
#[derive(Clone)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a session rooted at `base`, creating the base path if needed.
    pub fn open_session(&self, base: &str) -> CoordResult<Arc<MemoryConnection>> {
        path::validate(base)?;
        let mut tree = self.lock();
        let session = tree.next_session;
        tree.next_session += 1;
        tree.open_sessions.insert(session);

        let mut notices = Vec::new();
        if !tree.nodes.contains_key(base) {
            ensure_parents(&mut tree.nodes, base, &mut notices)?;
            create_node(&mut tree.nodes, base, Vec::new(), None, false, &mut notices)?;
        }
        let firing = tree.collect(notices);
        drop(tree);
        fire(firing);

        debug!(session, base, "Opened in-memory session");
        Ok(Arc::new(MemoryConnection {
            store: self.clone(),
            session,
            base: base.to_string(),
        }))
    }

    /// Makes the next operation on any session fail with `error`.
    pub fn fail_next(&self, error: CoordError) {
        self.lock().faults.push_back(error);
    }

    /// Number of nodes in the tree, including the root.
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }
}

#[async_trait]
impl Driver for MemoryStore {
    async fn connect(&self, base: &str) -> CoordResult<Arc<dyn Connection>> {
        let conn: Arc<dyn Connection> = self.open_session(base)?;
        Ok(conn)
    }
}

// =============================================================================
// Session
// =============================================================================

/// One session against a [`MemoryStore`].
pub struct MemoryConnection {
    store: MemoryStore,
    session: u64,
    base: String,
}

impl MemoryConnection {
    pub fn session_id(&self) -> u64 {
        self.session
    }

    fn abs(&self, rel: &str) -> CoordResult<String> {
        path::validate(rel)?;
        Ok(match (self.base.as_str(), rel) {
            ("/", _) => rel.to_string(),
            (base, "/") => base.to_string(),
            (base, _) => format!("{base}{rel}"),
        })
    }

    /// Locks the tree after checking the session and any injected fault.
    fn enter(&self) -> CoordResult<MutexGuard<'_, Tree>> {
        let mut tree = self.store.lock();
        if !tree.open_sessions.contains(&self.session) {
            return Err(CoordError::ConnectionClosed);
        }
        if let Some(fault) = tree.faults.pop_front() {
            return Err(fault);
        }
        Ok(tree)
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut Nodes, &mut Vec<Notice>) -> CoordResult<T>,
    ) -> CoordResult<T> {
        let mut tree = self.enter()?;
        let mut notices = Vec::new();
        let result = apply(&mut tree.nodes, &mut notices);
        let firing = tree.collect(notices);
        drop(tree);
        fire(firing);
        result
    }

    fn close_session(&self) {
        let mut tree = self.store.lock();
        if !tree.open_sessions.remove(&self.session) {
            return;
        }

        let mut own = Vec::new();
        for slot in [Slot::Data, Slot::Children] {
            for (abs, regs) in tree.watches(slot).iter_mut() {
                let (mine, rest): (Vec<_>, Vec<_>) =
                    std::mem::take(regs).into_iter().partition(|r| r.session == self.session);
                *regs = rest;
                own.extend(mine.into_iter().map(|r| (r, EventKind::Session, abs.clone())));
            }
        }

        let ephemerals: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, e)| e.owner == Some(self.session))
            .map(|(p, _)| p.clone())
            .collect();
        let mut notices = Vec::new();
        for node in &ephemerals {
            let _ = delete_node(&mut tree.nodes, node, None, &mut notices);
        }
        let firing = tree.collect(notices);
        drop(tree);

        debug!(
            session = self.session,
            ephemerals = ephemerals.len(),
            "Closed in-memory session"
        );
        fire(own);
        fire(firing);
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close_session();
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_raw(&self, path: &str, data: Vec<u8>) -> CoordResult<Version> {
        let abs = self.abs(path)?;
        self.mutate(|nodes, notices| {
            if !nodes.contains_key(&abs) {
                ensure_parents(nodes, &abs, notices)?;
            }
            let (_, version) = create_node(nodes, &abs, data, None, false, notices)?;
            Ok(Version::new(version))
        })
    }

    async fn create_ephemeral_raw(
        &self,
        path: &str,
        data: Vec<u8>,
        sequential: bool,
    ) -> CoordResult<String> {
        let abs = self.abs(path)?;
        let session = self.session;
        let full = self.mutate(|nodes, notices| {
            ensure_parents(nodes, &abs, notices)?;
            create_node(nodes, &abs, data, Some(session), sequential, notices)
                .map(|(full, _)| full)
        })?;
        Ok(relative(&self.base, &full))
    }

    async fn get_raw(&self, path: &str) -> CoordResult<(Vec<u8>, Version)> {
        let abs = self.abs(path)?;
        let tree = self.enter()?;
        let entry = tree.nodes.get(&abs).ok_or(CoordError::NoNode)?;
        Ok((entry.data.clone(), Version::new(entry.version)))
    }

    async fn get_w_raw(&self, path: &str) -> CoordResult<(Vec<u8>, Version, Watch)> {
        let abs = self.abs(path)?;
        let mut tree = self.enter()?;
        let (data, version) = {
            let entry = tree.nodes.get(&abs).ok_or(CoordError::NoNode)?;
            (entry.data.clone(), Version::new(entry.version))
        };
        let watch = tree.register(Slot::Data, &abs, self.session, &self.base);
        Ok((data, version, watch))
    }

    async fn set_raw(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<Version>,
    ) -> CoordResult<Version> {
        let abs = self.abs(path)?;
        self.mutate(|nodes, notices| set_node(nodes, &abs, data, version, notices))
            .map(Version::new)
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        let abs = self.abs(path)?;
        self.mutate(|nodes, notices| delete_tree(nodes, &abs, notices))
    }

    async fn exists(&self, path: &str) -> CoordResult<bool> {
        let abs = self.abs(path)?;
        let tree = self.enter()?;
        Ok(tree.nodes.contains_key(&abs))
    }

    async fn exists_w(&self, path: &str) -> CoordResult<(bool, Watch)> {
        let abs = self.abs(path)?;
        let mut tree = self.enter()?;
        let exists = tree.nodes.contains_key(&abs);
        let watch = tree.register(Slot::Data, &abs, self.session, &self.base);
        Ok((exists, watch))
    }

    async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        let abs = self.abs(path)?;
        let tree = self.enter()?;
        let entry = tree.nodes.get(&abs).ok_or(CoordError::NoNode)?;
        Ok(entry.children.iter().cloned().collect())
    }

    async fn children_w(&self, path: &str) -> CoordResult<(Vec<String>, Watch)> {
        let abs = self.abs(path)?;
        let mut tree = self.enter()?;
        let children: Vec<String> = tree
            .nodes
            .get(&abs)
            .ok_or(CoordError::NoNode)?
            .children
            .iter()
            .cloned()
            .collect();
        let watch = tree.register(Slot::Children, &abs, self.session, &self.base);
        Ok((children, watch))
    }

    async fn multi(&self, ops: Vec<Op>) -> CoordResult<()> {
        let mut resolved = Vec::with_capacity(ops.len());
        for op in ops {
            let abs = self.abs(op.path())?;
            resolved.push((abs, op));
        }

        let mut tree = self.enter()?;
        let mut staged = tree.nodes.clone();
        let mut notices = Vec::new();
        for (abs, op) in resolved {
            match op {
                Op::Create { data, .. } => {
                    create_node(&mut staged, &abs, data, None, false, &mut notices)?;
                }
                Op::Set { data, version, .. } => {
                    set_node(&mut staged, &abs, data, version, &mut notices)?;
                }
                Op::Delete { version, .. } => {
                    delete_node(&mut staged, &abs, version, &mut notices)?;
                }
            }
        }
        tree.nodes = staged;
        let firing = tree.collect(notices);
        drop(tree);
        fire(firing);
        Ok(())
    }

    async fn close(&self) {
        self.close_session();
    }

    fn is_closed(&self) -> bool {
        !self.store.lock().open_sessions.contains(&self.session)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{ConnectionExt, Dir, Transaction};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Payload {
        value: u32,
        #[serde(skip)]
        version: Option<Version>,
    }

    crate::impl_node!(Payload);

    fn payload(value: u32) -> Payload {
        Payload {
            value,
            version: None,
        }
    }

    #[tokio::test]
    async fn test_create_get_set_roundtrip() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();

        let mut node = payload(1);
        conn.create("/a/b/c", &mut node).await.unwrap();
        assert!(conn.exists("/a/b").await.unwrap());

        let mut read: Payload = conn.get("/a/b/c").await.unwrap();
        assert_eq!(read.value, 1);
        read.value = 2;
        conn.set("/a/b/c", &mut read).await.unwrap();

        let again: Payload = conn.get("/a/b/c").await.unwrap();
        assert_eq!(again.value, 2);
        assert_eq!(again.version, read.version);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        conn.create("/n", &mut payload(1)).await.unwrap();

        let mut first: Payload = conn.get("/n").await.unwrap();
        let mut second: Payload = conn.get("/n").await.unwrap();
        first.value = 10;
        conn.set("/n", &mut first).await.unwrap();

        second.value = 20;
        let err = conn.set("/n", &mut second).await.unwrap_err();
        assert_eq!(err, CoordError::BadVersion);
    }

    #[tokio::test]
    async fn test_directory_nodes_have_no_payload() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        conn.create_dir("/dir").await.unwrap();
        let err = conn.get::<Payload>("/dir").await.unwrap_err();
        assert_eq!(err, CoordError::EmptyNode);
        assert_eq!(
            conn.create_dir("/dir").await.unwrap_err(),
            CoordError::NodeExists
        );
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_die_with_session() {
        let store = MemoryStore::new();
        let owner = store.open_session("/").unwrap();
        let observer = store.open_session("/").unwrap();

        owner.create_ephemeral("/live/me", &payload(1)).await.unwrap();
        let (exists, watch) = observer.exists_w("/live/me").await.unwrap();
        assert!(exists);

        owner.close().await;
        assert!(owner.is_closed());
        assert_eq!(watch.wait().await.kind, EventKind::Deleted);
        assert!(!observer.exists("/live/me").await.unwrap());
        assert_eq!(
            owner.exists("/live").await.unwrap_err(),
            CoordError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_ephemeral_cannot_have_children() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        conn.create_ephemeral("/e", &payload(1)).await.unwrap();
        let err = conn.create_dir("/e/child").await.unwrap_err();
        assert_eq!(err, CoordError::NoChildrenForEphemerals);
    }

    #[tokio::test]
    async fn test_sequential_names_are_ordered() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        let first = conn
            .create_ephemeral_sequential("/q/item-", &payload(1))
            .await
            .unwrap();
        let second = conn
            .create_ephemeral_sequential("/q/item-", &payload(2))
            .await
            .unwrap();
        assert_eq!(first, "/q/item-0000000000");
        assert_eq!(second, "/q/item-0000000001");
        assert_eq!(
            conn.children("/q").await.unwrap(),
            vec!["item-0000000000", "item-0000000001"]
        );
    }

    #[tokio::test]
    async fn test_watches_fire_once_per_arm() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        conn.create_dir("/parent").await.unwrap();

        let (children, watch) = conn.children_w("/parent").await.unwrap();
        assert!(children.is_empty());
        conn.create_dir("/parent/a").await.unwrap();
        assert_eq!(watch.wait().await.kind, EventKind::ChildrenChanged);

        conn.delete("/parent/a").await.unwrap();
        let (_, watch) = conn.children_w("/parent").await.unwrap();
        conn.delete("/parent").await.unwrap();
        assert_eq!(watch.wait().await.kind, EventKind::Deleted);
    }

    #[tokio::test]
    async fn test_exists_watch_fires_on_create() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        let (exists, watch) = conn.exists_w("/later").await.unwrap();
        assert!(!exists);
        conn.create_dir("/later").await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), watch.wait())
            .await
            .unwrap();
        assert_eq!(event.kind, EventKind::Created);
        assert_eq!(event.path, "/later");
    }

    #[tokio::test]
    async fn test_close_fires_own_watches_with_session() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        let (_, watch) = conn.exists_w("/never").await.unwrap();
        conn.close().await;
        assert!(watch.wait().await.is_session());
    }

    #[tokio::test]
    async fn test_multi_is_all_or_nothing() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        conn.create_dir("/t").await.unwrap();
        conn.create("/t/existing", &mut payload(1)).await.unwrap();

        let mut txn = Transaction::new();
        txn.create("/t/new", &payload(2))
            .create("/t/existing", &payload(3));
        assert_eq!(conn.commit(txn).await.unwrap_err(), CoordError::NodeExists);
        assert!(!conn.exists("/t/new").await.unwrap());

        let mut stale: Payload = conn.get("/t/existing").await.unwrap();
        conn.set("/t/existing", &mut payload(4)).await.unwrap();
        stale.value = 5;
        let mut txn = Transaction::new();
        txn.create("/t/other", &payload(6)).set("/t/existing", &stale);
        assert_eq!(conn.commit(txn).await.unwrap_err(), CoordError::BadVersion);
        assert!(!conn.exists("/t/other").await.unwrap());

        let mut txn = Transaction::new();
        txn.create("/t/new", &payload(7)).delete("/t/existing");
        conn.commit(txn).await.unwrap();
        assert!(conn.exists("/t/new").await.unwrap());
        assert!(!conn.exists("/t/existing").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_subtree() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        conn.create_dir("/r/a/b/c").await.unwrap();
        conn.create_dir("/r/x").await.unwrap();

        let order = conn.subtree("/r").await.unwrap();
        let pos = |p: &str| order.iter().position(|o| o == p).unwrap();
        assert!(pos("/r/a/b/c") < pos("/r/a/b"));
        assert!(pos("/r/a") < pos("/r"));

        conn.delete("/r").await.unwrap();
        assert!(!conn.exists("/r").await.unwrap());
        assert_eq!(store.node_count(), 1);
        assert_eq!(conn.delete("/r").await.unwrap_err(), CoordError::NoNode);
    }

    #[tokio::test]
    async fn test_transactional_subtree_delete() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        conn.create_dir("/h/instances/one").await.unwrap();

        let mut txn = Transaction::new();
        conn.delete_subtree(&mut txn, "/h").await.unwrap();
        assert_eq!(txn.len(), 3);
        conn.commit(txn).await.unwrap();
        assert!(!conn.exists("/h").await.unwrap());
    }

    #[tokio::test]
    async fn test_sessions_are_rooted_at_base() {
        let store = MemoryStore::new();
        let root = store.open_session("/").unwrap();
        let pool = store.open_session("/pools/p1").unwrap();

        pool.create_dir("/services").await.unwrap();
        assert!(root.exists("/pools/p1/services").await.unwrap());
        assert_eq!(pool.children("/").await.unwrap(), vec!["services"]);

        let (_, watch) = pool.exists_w("/hosts").await.unwrap();
        root.create_dir("/pools/p1/hosts").await.unwrap();
        assert_eq!(watch.wait().await.path, "/hosts");
    }

    #[tokio::test]
    async fn test_injected_fault_fails_once() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        store.fail_next(CoordError::NoServer);
        assert_eq!(conn.exists("/").await.unwrap_err(), CoordError::NoServer);
        assert!(conn.exists("/").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_if_absent_and_ensure_path() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        conn.ensure_path("/a/b").await.unwrap();
        conn.ensure_path("/a/b").await.unwrap();
        conn.create_if_absent("/a/b", &mut Dir::default()).await.unwrap();
        assert!(conn.exists("/a/b").await.unwrap());
    }
}
