//! Watch-driven task supervision.
//!
//! [`listen`] watches the children of a parent path and keeps exactly one
//! task per child. [`manage`] wraps a [`Listener`] with reconnect handling so
//! that a lost coordination-store session tears every task down and starts
//! over on a fresh connection.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use shoal_coord::{Connection, ConnectionRegistry, CoordError, CoordResult};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::BackoffPolicy;

// =============================================================================
// Core Traits
// =============================================================================

/// A source of per-child tasks.
///
/// The supervisor calls [`Spawner::pre`] and then [`Spawner::spawn`] once for
/// each new child of [`Spawner::path`], and [`Spawner::post`] after every pass
/// with the set of children that currently have a live task.
#[async_trait]
pub trait Spawner: Send + Sync + 'static {
    /// Hands the spawner the connection its tasks should use.
    fn set_connection(&self, conn: Arc<dyn Connection>);

    /// Parent path whose children are tasks.
    fn path(&self) -> String;

    /// Called synchronously before each task is spawned.
    fn pre(&self) {}

    /// Runs the task for `child` until the child goes away or `cancel` fires.
    async fn spawn(&self, cancel: watch::Receiver<bool>, child: String);

    /// Called after every pass, including one before the first task starts
    /// and one after the last task has finished.
    async fn post(&self, _active: &HashSet<String>) {}
}

/// A top-level listener run by [`manage`] against each connection it obtains.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Runs until `shutdown` fires or the connection is lost.
    async fn listen(self: Arc<Self>, shutdown: watch::Receiver<bool>, conn: Arc<dyn Connection>);

    /// Called after every `listen` returns.
    async fn exited(&self) {}
}

// =============================================================================
// Helpers
// =============================================================================

/// Resolves once `shutdown` carries `true` or its sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Holds the connection a spawner was given.
#[derive(Default)]
pub struct ConnectionSlot {
    conn: RwLock<Option<Arc<dyn Connection>>>,
}

impl ConnectionSlot {
    pub fn set(&self, conn: Arc<dyn Connection>) {
        *self.conn.write().unwrap_or_else(PoisonError::into_inner) = Some(conn);
    }

    /// The current connection, or `ConnectionClosed` if none was set.
    pub fn get(&self) -> CoordResult<Arc<dyn Connection>> {
        self.conn
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CoordError::ConnectionClosed)
    }
}

/// Reports a task's completion when dropped, so a panicking task still
/// leaves the active set.
struct Completion {
    child: Option<String>,
    done: mpsc::UnboundedSender<String>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(child) = self.child.take() {
            let _ = self.done.send(child);
        }
    }
}

// =============================================================================
// Listen
// =============================================================================

/// Keeps one task per child of `spawner.path()` until `shutdown` fires or
/// the connection is lost, then cancels every task and waits for all of them.
#[instrument(skip_all, fields(path = %spawner.path()))]
pub async fn listen<S: Spawner + ?Sized>(
    mut shutdown: watch::Receiver<bool>,
    conn: Arc<dyn Connection>,
    spawner: Arc<S>,
) {
    spawner.set_connection(Arc::clone(&conn));
    let path = spawner.path();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
    let mut active: HashSet<String> = HashSet::new();

    loop {
        let (children, watch) = match conn.children_w(&path).await {
            Ok(found) => found,
            Err(CoordError::NoNode) => match conn.exists_w(&path).await {
                Ok((true, _)) => continue,
                Ok((false, watch)) => {
                    debug!("Waiting for parent path to exist");
                    (Vec::new(), watch)
                }
                Err(e) => {
                    warn!(error = %e, "Could not watch parent path");
                    break;
                }
            },
            Err(e) => {
                warn!(error = %e, "Could not watch children");
                break;
            }
        };

        for child in children {
            if active.contains(&child) {
                continue;
            }
            spawner.pre();
            active.insert(child.clone());
            debug!(child = %child, "Spawning task");

            let task = Arc::clone(&spawner);
            let cancel = cancel_rx.clone();
            let completion = Completion {
                child: Some(child.clone()),
                done: done_tx.clone(),
            };
            tokio::spawn(async move {
                let _completion = completion;
                task.spawn(cancel, child).await;
            });
        }

        spawner.post(&active).await;

        tokio::select! {
            biased;

            _ = wait_for_shutdown(&mut shutdown) => {
                debug!("Listener received shutdown signal");
                break;
            }

            Some(child) = done_rx.recv() => {
                debug!(child = %child, "Task finished");
                active.remove(&child);
            }

            event = watch.wait() => {
                if event.is_session() {
                    warn!("Coordination session lost");
                    break;
                }
            }
        }
    }

    let _ = cancel_tx.send(true);
    info!(tasks = active.len(), "Stopping tasks");
    while !active.is_empty() {
        match done_rx.recv().await {
            Some(child) => {
                active.remove(&child);
            }
            None => break,
        }
    }
    spawner.post(&active).await;
    info!("Listener stopped");
}

// =============================================================================
// Manage
// =============================================================================

/// Runs `listener` against connections for `root` until `shutdown` fires,
/// reconnecting with backoff whenever the connection is lost.
#[instrument(skip(shutdown, registry, listener, backoff))]
pub async fn manage<L: Listener + ?Sized>(
    mut shutdown: watch::Receiver<bool>,
    registry: Arc<ConnectionRegistry>,
    root: String,
    listener: Arc<L>,
    backoff: BackoffPolicy,
) {
    let mut attempt = 0u32;
    loop {
        if *shutdown.borrow() {
            break;
        }

        match registry.get_connection(&root).await {
            Ok(conn) => {
                Arc::clone(&listener)
                    .listen(shutdown.clone(), Arc::clone(&conn))
                    .await;
                listener.exited().await;
                // A listener that returned on a live connection failed on
                // its own; back off instead of spinning on it.
                attempt = if conn.is_closed() { 0 } else { attempt.saturating_add(1) };
            }
            Err(e) => {
                warn!(attempt, error = %e, "Could not acquire coordination connection");
                attempt = attempt.saturating_add(1);
            }
        }

        let delay = backoff.delay(attempt);
        tokio::select! {
            biased;

            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!("Listener manager stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use shoal_coord::memory::MemoryStore;
    use shoal_coord::ConnectionExt;

    use super::*;

    /// Records lifecycle calls; each task runs until its child is deleted or
    /// it is cancelled.
    #[derive(Default)]
    struct Recorder {
        conn: ConnectionSlot,
        pre_calls: AtomicUsize,
        running: AtomicUsize,
        started: Mutex<Vec<String>>,
        posts: Mutex<Vec<HashSet<String>>>,
        panic_on: Option<String>,
    }

    #[async_trait]
    impl Spawner for Recorder {
        fn set_connection(&self, conn: Arc<dyn Connection>) {
            self.conn.set(conn);
        }

        fn path(&self) -> String {
            "/tasks".to_string()
        }

        fn pre(&self) {
            self.pre_calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn spawn(&self, mut cancel: watch::Receiver<bool>, child: String) {
            self.started.lock().unwrap().push(child.clone());
            if self.panic_on.as_deref() == Some(child.as_str()) {
                panic!("task failure");
            }
            let Ok(conn) = self.conn.get() else { return };
            self.running.fetch_add(1, Ordering::SeqCst);
            loop {
                let Ok((true, watch)) = conn.exists_w(&format!("/tasks/{child}")).await else {
                    break;
                };
                tokio::select! {
                    _ = wait_for_shutdown(&mut cancel) => break,
                    _ = watch.wait() => {}
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
        }

        async fn post(&self, active: &HashSet<String>) {
            self.posts.lock().unwrap().push(active.clone());
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_one_task_per_child() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        let spawner = Arc::new(Recorder::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(listen(shutdown_rx, conn.clone(), Arc::clone(&spawner)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.create_dir("/tasks/a").await.unwrap();
        conn.create_dir("/tasks/b").await.unwrap();
        eventually(|| spawner.running.load(Ordering::SeqCst) == 2).await;

        conn.delete("/tasks/a").await.unwrap();
        eventually(|| spawner.running.load(Ordering::SeqCst) == 1).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(spawner.running.load(Ordering::SeqCst), 0);
        assert_eq!(spawner.pre_calls.load(Ordering::SeqCst), 2);
        let started = spawner.started.lock().unwrap().clone();
        assert_eq!(started.len(), 2);

        let posts = spawner.posts.lock().unwrap();
        assert!(posts.first().unwrap().is_empty());
        assert!(posts.last().unwrap().is_empty());
        assert!(posts.iter().any(|p| p.len() == 2));
    }

    #[tokio::test]
    async fn test_waits_for_parent_to_exist() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        let spawner = Arc::new(Recorder::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(listen(shutdown_rx, conn.clone(), Arc::clone(&spawner)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(spawner.started.lock().unwrap().is_empty());

        conn.create_dir("/tasks/late").await.unwrap();
        eventually(|| spawner.running.load(Ordering::SeqCst) == 1).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(spawner.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_leaves_active_set() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        conn.create_dir("/tasks").await.unwrap();
        let spawner = Arc::new(Recorder {
            panic_on: Some("bad".to_string()),
            ..Recorder::default()
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(listen(shutdown_rx, conn.clone(), Arc::clone(&spawner)));
        conn.create_dir("/tasks/bad").await.unwrap();
        eventually(|| !spawner.started.lock().unwrap().is_empty()).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_session_loss_stops_listener() {
        let store = MemoryStore::new();
        let conn = store.open_session("/").unwrap();
        conn.create_dir("/tasks/a").await.unwrap();
        let spawner = Arc::new(Recorder::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(listen(shutdown_rx, conn.clone(), Arc::clone(&spawner)));
        eventually(|| spawner.running.load(Ordering::SeqCst) == 1).await;

        conn.close().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(spawner.running.load(Ordering::SeqCst), 0);
    }

    struct CountingListener {
        spawner: Arc<Recorder>,
        runs: AtomicUsize,
        exits: AtomicUsize,
    }

    #[async_trait]
    impl Listener for CountingListener {
        async fn listen(
            self: Arc<Self>,
            shutdown: watch::Receiver<bool>,
            conn: Arc<dyn Connection>,
        ) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            listen(shutdown, conn, Arc::clone(&self.spawner)).await;
        }

        async fn exited(&self) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_manage_reconnects_after_session_loss() {
        let store = MemoryStore::new();
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(store.clone())));
        let listener = Arc::new(CountingListener {
            spawner: Arc::new(Recorder::default()),
            runs: AtomicUsize::new(0),
            exits: AtomicUsize::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backoff = BackoffPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
            jitter: 0.0,
        };

        let handle = tokio::spawn(manage(
            shutdown_rx,
            Arc::clone(&registry),
            "/".to_string(),
            Arc::clone(&listener),
            backoff,
        ));
        eventually(|| listener.runs.load(Ordering::SeqCst) == 1).await;

        let conn = registry.get_connection("/").await.unwrap();
        conn.close().await;
        eventually(|| listener.runs.load(Ordering::SeqCst) == 2).await;
        assert_eq!(listener.exits.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listener.exits.load(Ordering::SeqCst), 2);
    }
}
