//! Per-instance state machine.
//!
//! One task runs for every instance scheduled on this host, watching the
//! host half of its state:
//!
//! ```text
//!              attach/start              pause
//! Unattached ───────────────▶ Running ◀────────▶ Paused
//!     ▲                          │        resume
//!     └──────── exit ────────────┘
//! ```
//!
//! `Stop`, deletion of either half, or shutdown stops the container and
//! deletes the state. A task cancelled by its supervisor without a shutdown
//! (the session was lost) leaves the container running and parks it; the
//! next task for the same state id picks it back up.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shoal_coord::{Connection, ConnectionExt, CoordError, Event};
use shoal_id::{HostId, PoolId};
use shoal_reconcile::{listen, wait_for_shutdown, ConnectionSlot, Listener, RetryPolicy, Spawner};
use shoal_state::{
    clean_host_states, delete_state, paths, register_online, unregister_online, update_state,
    DesiredState, ErrorKind, HostState, ServiceState, StateError, StateRequest,
};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::handler::{ContainerHandler, ExitNotification};
use crate::Config;

/// What a task knows about its container.
#[derive(Debug, Default)]
struct Thread {
    state: ServiceState,
    /// Present only while the task is parked; a running task owns it.
    exit: Option<ExitNotification>,
}

/// How a task ends.
enum Outcome {
    /// Stop the container and delete the state.
    Cleanup,
    /// Keep the container and hand it to the next task.
    Park,
}

/// What woke a waiting task.
enum Wake {
    Shutdown,
    Cancel,
    Changed(Event),
    Exited(DateTime<Utc>),
}

/// Runs the instances scheduled on one host.
pub struct HostStateListener {
    pool: PoolId,
    host: HostId,
    handler: Arc<dyn ContainerHandler>,
    conn: ConnectionSlot,
    terminate_retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
    threads: Mutex<HashMap<String, Thread>>,
}

impl HostStateListener {
    pub fn new(
        handler: Arc<dyn ContainerHandler>,
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool: config.pool_id,
            host: config.host_id,
            handler,
            conn: ConnectionSlot::default(),
            terminate_retry: config.terminate_retry.clone(),
            shutdown,
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// State ids with a live or parked container.
    pub fn tracked(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.threads().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn threads(&self) -> std::sync::MutexGuard<'_, HashMap<String, Thread>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Records the latest state for a running task.
    fn track(&self, state_id: &str, state: &ServiceState) {
        let mut threads = self.threads();
        let thread = threads.entry(state_id.to_string()).or_default();
        thread.state = state.clone();
        thread.exit = None;
    }

    #[instrument(skip(self, cancel, conn), fields(host_id = %self.host))]
    async fn run(&self, cancel: &mut watch::Receiver<bool>, conn: &dyn Connection, state_id: &str) {
        let req = match StateRequest::from_state_id(&self.pool, state_id) {
            Ok(req) if req.host_id == self.host => req,
            parsed => {
                warn!(host_matches = parsed.is_ok(), "Invalid state id, deleting");
                match conn.delete(&paths::host_instance(&self.pool, &self.host, state_id)).await {
                    Ok(()) | Err(CoordError::NoNode) => {}
                    Err(e) => warn!(error = %e, "Could not delete host state"),
                }
                return;
            }
        };

        let parked = self.threads().remove(state_id);
        let (mut state, mut exit) = match parked {
            Some(thread) => {
                debug!("Reattaching parked container");
                if let Err(e) = self.persist(conn, &req, &thread.state).await {
                    warn!(error = %e, "Could not restore state for parked container");
                    self.threads().insert(state_id.to_string(), thread);
                    return;
                }
                (thread.state, thread.exit)
            }
            None => {
                let sspth = paths::service_instance(&self.pool, &req.service_id, state_id);
                match conn.get::<ServiceState>(&sspth).await {
                    Ok(state) => (state, None),
                    Err(CoordError::NoNode) => {
                        info!("Service state is missing, cleaning up");
                        self.shut_down(conn, &req, None).await;
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not load service state");
                        return;
                    }
                }
            }
        };
        self.track(state_id, &state);

        let outcome = loop {
            let hspth = paths::host_instance(&self.pool, &self.host, state_id);
            let (host, host_watch) = match conn.get_w::<HostState>(&hspth).await {
                Ok(found) => found,
                Err(CoordError::NoNode) => {
                    debug!("Host state was removed");
                    break Outcome::Cleanup;
                }
                Err(e) => {
                    warn!(error = %e, "Could not watch host state");
                    break Outcome::Park;
                }
            };

            let sspth = paths::service_instance(&self.pool, &req.service_id, state_id);
            let service_watch = match conn.exists_w(&sspth).await {
                Ok((true, watch)) => watch,
                Ok((false, _)) => {
                    debug!("Service state was removed");
                    break Outcome::Cleanup;
                }
                Err(e) => {
                    warn!(error = %e, "Could not watch service state");
                    break Outcome::Park;
                }
            };

            if let Some(outcome) = self.apply(conn, &req, &host, &mut state, &mut exit).await {
                break outcome;
            }

            let mut shutdown = self.shutdown.clone();
            let wake = tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut shutdown) => Wake::Shutdown,
                _ = wait_for_shutdown(cancel) => Wake::Cancel,
                at = async {
                    match exit.as_mut() {
                        Some(exit) => exit.exited().await,
                        None => std::future::pending().await,
                    }
                } => Wake::Exited(at),
                event = host_watch.wait() => Wake::Changed(event),
                event = service_watch.wait() => Wake::Changed(event),
            };

            match wake {
                Wake::Shutdown => break Outcome::Cleanup,
                Wake::Cancel => break Outcome::Park,
                Wake::Changed(event) if event.is_session() => break Outcome::Park,
                Wake::Changed(_) => {}
                Wake::Exited(at) => {
                    warn!(terminated = %at, "Container exited, restarting");
                    exit = None;
                    state.terminated = Some(at);
                    self.track(state_id, &state);
                    if let Err(e) = self.record_exit(conn, &req, &state).await {
                        warn!(error = %e, "Could not record container exit");
                        break Outcome::Park;
                    }
                }
            }
        };

        match outcome {
            Outcome::Cleanup => self.shut_down(conn, &req, exit).await,
            Outcome::Park => {
                debug!(attached = exit.is_some(), "Parking container");
                self.threads()
                    .insert(state_id.to_string(), Thread { state, exit });
            }
        }
    }

    /// Moves the container toward the host half's desired state. Returns an
    /// outcome when the task should end.
    async fn apply(
        &self,
        conn: &dyn Connection,
        req: &StateRequest,
        host: &HostState,
        state: &mut ServiceState,
        exit: &mut Option<ExitNotification>,
    ) -> Option<Outcome> {
        let state_id = req.state_id();
        let (service, instance) = (&req.service_id, req.instance_id);

        if exit.is_none() {
            match self.handler.attach_container(state, service, instance).await {
                Ok(attached) => *exit = attached,
                Err(e) => {
                    warn!(error = %e, "Could not attach to container");
                    return Some(Outcome::Cleanup);
                }
            }
        }

        match host.desired_state {
            DesiredState::Run if exit.is_none() => {
                let (mut started, notification) = match self
                    .handler
                    .start_container(self.shutdown.clone(), service, instance)
                    .await
                {
                    Ok(started) => started,
                    Err(e) => {
                        warn!(error = %e, "Could not start container");
                        return Some(Outcome::Cleanup);
                    }
                };
                if started.image_id.is_empty() {
                    started.image_id = std::mem::take(&mut state.image_id);
                }
                // Keep the last exit visible after a restart.
                started.terminated = started.terminated.or(state.terminated);
                *state = started;
                *exit = Some(notification);
                info!(container_id = %state.container_id, "Started container");
            }
            DesiredState::Run if state.paused => {
                if let Err(e) = self.handler.resume_container(service, instance).await {
                    warn!(error = %e, "Could not resume container");
                    return Some(Outcome::Cleanup);
                }
                state.paused = false;
                debug!("Resumed paused container");
            }
            DesiredState::Pause if exit.is_some() && !state.paused => {
                if let Err(e) = self.handler.pause_container(service, instance).await {
                    warn!(error = %e, "Could not pause container");
                    return Some(Outcome::Cleanup);
                }
                state.paused = true;
                debug!("Paused running container");
            }
            DesiredState::Stop => return Some(Outcome::Cleanup),
            _ => return None,
        }

        self.track(&state_id, state);
        if let Err(e) = self.persist(conn, req, state).await {
            warn!(error = %e, "Could not update service state");
            return Some(Outcome::Park);
        }
        None
    }

    async fn persist(&self, conn: &dyn Connection, req: &StateRequest, state: &ServiceState) -> Result<(), StateError> {
        update_state(conn, req, |s| {
            s.service = state.clone();
            true
        })
        .await
    }

    /// Writes the exit time, riding out a briefly unreachable store.
    async fn record_exit(&self, conn: &dyn Connection, req: &StateRequest, state: &ServiceState) -> Result<(), StateError> {
        self.terminate_retry
            .run(
                || self.persist(conn, req, state),
                |e: &StateError| e.kind == ErrorKind::Store(CoordError::NoServer),
            )
            .await
    }

    /// Stops the container, waits for it to exit and deletes the state.
    async fn shut_down(&self, conn: &dyn Connection, req: &StateRequest, exit: Option<ExitNotification>) {
        let state_id = req.state_id();
        match self.handler.stop_container(&req.service_id, req.instance_id).await {
            Ok(()) => {
                if let Some(mut exit) = exit {
                    let at = exit.exited().await;
                    debug!(state_id = %state_id, terminated = %at, "Container exited");
                }
            }
            Err(e) => warn!(state_id = %state_id, error = %e, "Could not stop container"),
        }

        if let Err(e) = delete_state(conn, req).await {
            warn!(error = %e, "Could not delete state for stopped container");
        }
        self.threads().remove(&state_id);
    }

    /// Shuts down parked containers whose state id is not in `keep`.
    async fn clean_up_parked(&self, conn: &dyn Connection, keep: &HashSet<String>) {
        let orphaned: Vec<(String, Thread)> = {
            let mut threads = self.threads();
            let ids: Vec<String> = threads.keys().filter(|id| !keep.contains(*id)).cloned().collect();
            ids.into_iter()
                .filter_map(|id| threads.remove(&id).map(|thread| (id, thread)))
                .collect()
        };

        for (state_id, thread) in orphaned {
            info!(state_id = %state_id, "Cleaning up orphaned container");
            match StateRequest::from_state_id(&self.pool, &state_id) {
                Ok(req) => self.shut_down(conn, &req, thread.exit).await,
                Err(e) => warn!(state_id = %state_id, error = %e, "Could not clean up container"),
            }
        }
    }
}

#[async_trait]
impl Spawner for HostStateListener {
    fn set_connection(&self, conn: Arc<dyn Connection>) {
        self.conn.set(conn);
    }

    fn path(&self) -> String {
        paths::host_instances(&self.pool, &self.host)
    }

    async fn spawn(&self, mut cancel: watch::Receiver<bool>, child: String) {
        if self.is_shutting_down() {
            debug!(state_id = %child, "Will not spawn, shutting down");
            return;
        }
        let conn = match self.conn.get() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(state_id = %child, error = %e, "No connection for instance");
                return;
            }
        };
        self.run(&mut cancel, conn.as_ref(), &child).await;
    }

    async fn post(&self, active: &HashSet<String>) {
        let Ok(conn) = self.conn.get() else {
            return;
        };
        // Parked containers wait for the next session.
        if conn.is_closed() {
            return;
        }
        self.clean_up_parked(conn.as_ref(), active).await;
        if let Err(e) = clean_host_states(conn.as_ref(), &self.pool, &self.host).await {
            warn!(error = %e, "Could not clean up host states");
        }
    }
}

#[async_trait]
impl Listener for HostStateListener {
    #[instrument(skip_all, fields(host_id = %self.host))]
    async fn listen(self: Arc<Self>, shutdown: watch::Receiver<bool>, conn: Arc<dyn Connection>) {
        let marker = match register_online(conn.as_ref(), &self.pool, &self.host).await {
            Ok(marker) => marker,
            Err(e) => {
                warn!(error = %e, "Could not mark host online");
                return;
            }
        };
        info!("Host is online");

        listen(shutdown, Arc::clone(&conn), Arc::clone(&self)).await;

        if !conn.is_closed() {
            if let Err(e) = unregister_online(conn.as_ref(), &marker).await {
                warn!(error = %e, "Could not mark host offline");
            }
        }
        info!("Host state listener stopped");
    }

    async fn exited(&self) {
        if !self.is_shutting_down() {
            return;
        }
        let Ok(conn) = self.conn.get() else {
            return;
        };
        self.clean_up_parked(conn.as_ref(), &HashSet::new()).await;
    }
}
