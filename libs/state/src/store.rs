//! Transactional CRUD over paired instance states, plus the projections and
//! cleanup built on it.

use shoal_coord::{Connection, ConnectionExt, CoordError, CoordResult, Dir, Transaction};
use shoal_id::{HostId, PoolId, ServiceId};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::paths;
use crate::{ErrorKind, HostState, ServiceState, State, StateError, StateRequest};

fn halves(req: &StateRequest) -> (String, String) {
    let sid = req.state_id();
    (
        paths::host_instance(&req.pool_id, &req.host_id, &sid),
        paths::service_instance(&req.pool_id, &req.service_id, &sid),
    )
}

fn assemble(req: &StateRequest, host: HostState, service: ServiceState) -> State {
    State {
        host_id: req.host_id,
        service_id: req.service_id,
        instance_id: req.instance_id,
        host,
        service,
    }
}

/// Children of `path`, treating a missing parent as empty.
async fn children_or_empty(conn: &dyn Connection, path: &str) -> CoordResult<Vec<String>> {
    match conn.children(path).await {
        Ok(children) => Ok(children),
        Err(CoordError::NoNode) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

// =============================================================================
// CRUD
// =============================================================================

/// Reads both halves. A missing half is `NotFound`.
pub async fn get_state(conn: &dyn Connection, req: &StateRequest) -> Result<State, StateError> {
    let (hspth, sspth) = halves(req);

    let host: HostState = conn.get(&hspth).await.map_err(|e| {
        debug!(path = %hspth, error = %e, "Could not look up host state");
        StateError::new("get", req, e)
    })?;
    let service: ServiceState = conn.get(&sspth).await.map_err(|e| {
        debug!(path = %sspth, error = %e, "Could not look up service state");
        StateError::new("get", req, e)
    })?;

    Ok(assemble(req, host, service))
}

/// Schedules a new instance: host half `Run`/now, service half empty apart
/// from the image.
pub async fn create_state(
    conn: &dyn Connection,
    req: &StateRequest,
    image_id: &str,
) -> Result<(), StateError> {
    let instances = paths::host_instances(&req.pool_id, &req.host_id);
    conn.create_if_absent(&instances, &mut Dir::default())
        .await
        .map_err(|e| {
            debug!(path = %instances, error = %e, "Could not initialize host path");
            StateError::new("create", req, e)
        })?;

    let (hspth, sspth) = halves(req);
    let service = ServiceState {
        image_id: image_id.to_string(),
        ..ServiceState::default()
    };

    let mut txn = Transaction::new();
    txn.create(hspth, &HostState::scheduled_now())
        .create(sspth, &service);
    conn.commit(txn).await.map_err(|e| {
        debug!(error = %e, "Could not commit state creation");
        StateError::new("create", req, e)
    })?;

    debug!(state_id = %req.state_id(), "Created state");
    Ok(())
}

/// Reads both halves, applies `mutate` and writes both back at the versions
/// that were read. Nothing is written when `mutate` returns `false`.
pub async fn update_state<F>(
    conn: &dyn Connection,
    req: &StateRequest,
    mutate: F,
) -> Result<(), StateError>
where
    F: FnOnce(&mut State) -> bool + Send,
{
    let mut state = get_state(conn, req)
        .await
        .map_err(|e| StateError { op: "update", ..e })?;
    let (host_version, service_version) = (state.host.version, state.service.version);

    if !mutate(&mut state) {
        debug!(state_id = %req.state_id(), "Update skipped");
        return Ok(());
    }

    // The closure may have replaced either half wholesale.
    state.host.version = host_version;
    state.service.version = service_version;

    let (hspth, sspth) = halves(req);
    let mut txn = Transaction::new();
    txn.set(hspth, &state.host).set(sspth, &state.service);
    conn.commit(txn).await.map_err(|e| {
        debug!(error = %e, "Could not commit state update");
        StateError::new("update", req, e)
    })?;

    debug!(state_id = %req.state_id(), "Updated state");
    Ok(())
}

/// Deletes whichever halves exist and reports whether there were any.
/// Deleting nothing is not an error.
pub async fn delete_state(conn: &dyn Connection, req: &StateRequest) -> Result<bool, StateError> {
    let (hspth, sspth) = halves(req);
    let mut txn = Transaction::new();
    let mut found = false;

    for (half, path) in [("host", hspth), ("service", sspth)] {
        match conn.exists(&path).await {
            Ok(true) => {
                conn.delete_subtree(&mut txn, &path)
                    .await
                    .map_err(|e| StateError::new("delete", req, e))?;
                found = true;
            }
            Ok(false) => debug!(half, "No state to delete"),
            Err(e) => {
                debug!(half, error = %e, "Could not look up state");
                return Err(StateError::new("delete", req, e));
            }
        }
    }

    conn.commit(txn).await.map_err(|e| {
        debug!(error = %e, "Could not commit state deletion");
        StateError::new("delete", req, e)
    })?;

    debug!(state_id = %req.state_id(), found, "Deleted state");
    Ok(found)
}

/// Returns true if both halves exist.
pub async fn is_valid_state(conn: &dyn Connection, req: &StateRequest) -> Result<bool, StateError> {
    let (hspth, sspth) = halves(req);
    for path in [hspth, sspth] {
        if !conn
            .exists(&path)
            .await
            .map_err(|e| StateError::new("exists", req, e))?
        {
            return Ok(false);
        }
    }
    Ok(true)
}

// =============================================================================
// Projections
// =============================================================================

/// Requests for every parseable state under a service. Malformed ids are
/// skipped.
pub async fn get_service_state_ids(
    conn: &dyn Connection,
    pool: &PoolId,
    service: &ServiceId,
) -> CoordResult<Vec<StateRequest>> {
    let children = children_or_empty(conn, &paths::service(pool, service)).await?;
    Ok(children
        .iter()
        .filter_map(|sid| match StateRequest::from_state_id(pool, sid) {
            Ok(req) if req.service_id == *service => Some(req),
            _ => {
                debug!(service_id = %service, state_id = %sid, "Skipping malformed state id");
                None
            }
        })
        .collect())
}

/// Requests for every parseable state on a host. Malformed ids are skipped.
pub async fn get_host_state_ids(
    conn: &dyn Connection,
    pool: &PoolId,
    host: &HostId,
) -> CoordResult<Vec<StateRequest>> {
    let children = children_or_empty(conn, &paths::host_instances(pool, host)).await?;
    Ok(children
        .iter()
        .filter_map(|sid| match StateRequest::from_state_id(pool, sid) {
            Ok(req) if req.host_id == *host => Some(req),
            _ => {
                debug!(host_id = %host, state_id = %sid, "Skipping malformed state id");
                None
            }
        })
        .collect())
}

async fn load_states(conn: &dyn Connection, reqs: Vec<StateRequest>) -> CoordResult<Vec<State>> {
    let mut states = Vec::with_capacity(reqs.len());
    for req in reqs {
        match get_state(conn, &req).await {
            Ok(state) => states.push(state),
            Err(e) if e.is_not_found() => {
                debug!(state_id = %req.state_id(), "Skipping orphaned state");
            }
            Err(StateError {
                kind: ErrorKind::Store(inner),
                ..
            }) if inner.is_connection_lost() || inner == CoordError::NoServer => {
                return Err(inner);
            }
            Err(e) => warn!(error = %e, "Skipping unreadable state"),
        }
    }
    Ok(states)
}

/// Complete states scheduled for a service.
pub async fn get_service_states(
    conn: &dyn Connection,
    pool: &PoolId,
    service: &ServiceId,
) -> CoordResult<Vec<State>> {
    load_states(conn, get_service_state_ids(conn, pool, service).await?).await
}

/// Complete states scheduled on a host.
pub async fn get_host_states(
    conn: &dyn Connection,
    pool: &PoolId,
    host: &HostId,
) -> CoordResult<Vec<State>> {
    load_states(conn, get_host_state_ids(conn, pool, host).await?).await
}

// =============================================================================
// Bulk Deletion
// =============================================================================

async fn delete_each(conn: &dyn Connection, reqs: Vec<StateRequest>) -> usize {
    let mut count = 0;
    for req in reqs {
        match delete_state(conn, &req).await {
            Ok(true) => count += 1,
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Could not delete state"),
        }
    }
    count
}

/// Deletes every state of a service and returns how many went away.
pub async fn delete_service_states(
    conn: &dyn Connection,
    pool: &PoolId,
    service: &ServiceId,
) -> usize {
    let reqs = match get_service_state_ids(conn, pool, service).await {
        Ok(reqs) => reqs,
        Err(e) => {
            warn!(service_id = %service, error = %e, "Could not look up states on service");
            return 0;
        }
    };
    let count = delete_each(conn, reqs).await;
    debug!(service_id = %service, count, "Deleted service states");
    count
}

/// Deletes every state on a host and returns how many went away.
pub async fn delete_host_states(conn: &dyn Connection, pool: &PoolId, host: &HostId) -> usize {
    delete_host_states_when(conn, pool, host, |_| true).await
}

/// Deletes the states on a host that satisfy `when`.
pub async fn delete_host_states_when<F>(
    conn: &dyn Connection,
    pool: &PoolId,
    host: &HostId,
    when: F,
) -> usize
where
    F: Fn(&State) -> bool + Send + Sync,
{
    let reqs = match get_host_state_ids(conn, pool, host).await {
        Ok(reqs) => reqs,
        Err(e) => {
            warn!(host_id = %host, error = %e, "Could not look up states on host");
            return 0;
        }
    };

    let mut selected = Vec::new();
    for req in reqs {
        match get_state(conn, &req).await {
            Ok(state) if when(&state) => selected.push(req),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not load state from host"),
        }
    }
    let count = delete_each(conn, selected).await;
    debug!(host_id = %host, count, "Deleted host states");
    count
}

// =============================================================================
// Orphan Cleanup
// =============================================================================

/// Removes malformed state ids on a host and host halves whose service half
/// is missing.
pub async fn clean_host_states(conn: &dyn Connection, pool: &PoolId, host: &HostId) -> CoordResult<()> {
    let parent = paths::host_instances(pool, host);
    for sid in children_or_empty(conn, &parent).await? {
        match StateRequest::from_state_id(pool, &sid) {
            Ok(req) if req.host_id == *host => clean_one(conn, &req).await?,
            _ => delete_malformed(conn, &shoal_coord::path::join(&[&parent, &sid])).await?,
        }
    }
    Ok(())
}

/// Removes malformed state ids on a service and service halves whose host
/// half is missing.
pub async fn clean_service_states(
    conn: &dyn Connection,
    pool: &PoolId,
    service: &ServiceId,
) -> CoordResult<()> {
    let parent = paths::service(pool, service);
    for sid in children_or_empty(conn, &parent).await? {
        match StateRequest::from_state_id(pool, &sid) {
            Ok(req) if req.service_id == *service => clean_one(conn, &req).await?,
            _ => delete_malformed(conn, &shoal_coord::path::join(&[&parent, &sid])).await?,
        }
    }
    Ok(())
}

async fn clean_one(conn: &dyn Connection, req: &StateRequest) -> Result<(), StateError> {
    if !is_valid_state(conn, req).await? {
        delete_state(conn, req).await?;
        warn!(state_id = %req.state_id(), "Deleted incongruent state");
    }
    Ok(())
}

async fn delete_malformed(conn: &dyn Connection, path: &str) -> CoordResult<()> {
    match conn.delete(path).await {
        Ok(()) | Err(CoordError::NoNode) => {
            warn!(path, "Deleted invalid state id");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Waits until the state satisfies `check`.
///
/// Returns `Ok(None)` if `cancel` fires first and `NotFound` if the state is
/// deleted. A state with only one half is reported as `NotFound` as well.
pub async fn monitor_state<F>(
    conn: &dyn Connection,
    req: &StateRequest,
    mut cancel: watch::Receiver<bool>,
    check: F,
) -> Result<Option<State>, StateError>
where
    F: Fn(&State) -> bool + Send + Sync,
{
    let (hspth, sspth) = halves(req);
    loop {
        let host = conn.get_w::<HostState>(&hspth).await;
        let service = conn.get_w::<ServiceState>(&sspth).await;

        let (host, host_watch, service, service_watch) = match (host, service) {
            (Ok((h, hw)), Ok((s, sw))) => (h, hw, s, sw),
            (Err(e), _) | (_, Err(e)) => {
                debug!(state_id = %req.state_id(), error = %e, "State is not watchable");
                return Err(StateError::new("watch", req, e));
            }
        };

        let state = assemble(req, host, service);
        if check(&state) {
            return Ok(Some(state));
        }

        tokio::select! {
            biased;

            _ = cancel.wait_for(|stop| *stop) => {
                debug!(state_id = %req.state_id(), "Aborted state monitor");
                return Ok(None);
            }
            _ = host_watch.wait() => {}
            _ = service_watch.wait() => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use shoal_coord::memory::MemoryStore;

    use super::*;
    use crate::{DesiredState, ErrorKind};

    struct Fixture {
        store: MemoryStore,
        conn: Arc<dyn Connection>,
        pool: PoolId,
        host: HostId,
        service: ServiceId,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = MemoryStore::new();
            let conn: Arc<dyn Connection> = store.open_session("/").unwrap();
            let pool = PoolId::new();
            let service = ServiceId::new();
            conn.create_dir(&paths::service(&pool, &service)).await.unwrap();
            Self {
                store,
                conn,
                pool,
                host: HostId::new(),
                service,
            }
        }

        fn req(&self, instance_id: u32) -> StateRequest {
            StateRequest {
                pool_id: self.pool,
                host_id: self.host,
                service_id: self.service,
                instance_id,
            }
        }

        async fn halves_exist(&self, req: &StateRequest) -> (bool, bool) {
            let (h, s) = halves(req);
            (
                self.conn.exists(&h).await.unwrap(),
                self.conn.exists(&s).await.unwrap(),
            )
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let fx = Fixture::new().await;
        let req = fx.req(0);

        create_state(fx.conn.as_ref(), &req, "image-1").await.unwrap();
        let state = get_state(fx.conn.as_ref(), &req).await.unwrap();

        assert_eq!(state.host.desired_state, DesiredState::Run);
        assert_eq!(state.service.image_id, "image-1");
        assert!(state.service.container_id.is_empty());
        assert!(state.host.version.is_some());
        assert!(state.service.version.is_some());
    }

    #[tokio::test]
    async fn test_create_twice_is_already_exists() {
        let fx = Fixture::new().await;
        let req = fx.req(0);
        create_state(fx.conn.as_ref(), &req, "").await.unwrap();

        let err = create_state(fx.conn.as_ref(), &req, "").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
        assert_eq!(err.op, "create");
    }

    #[tokio::test]
    async fn test_create_is_atomic() {
        let fx = Fixture::new().await;
        let req = fx.req(1);
        let (_, sspth) = halves(&req);
        fx.conn.create_dir(&sspth).await.unwrap();

        create_state(fx.conn.as_ref(), &req, "").await.unwrap_err();
        assert_eq!(fx.halves_exist(&req).await, (false, true));
    }

    #[tokio::test]
    async fn test_get_missing_half() {
        let fx = Fixture::new().await;
        let req = fx.req(0);
        create_state(fx.conn.as_ref(), &req, "").await.unwrap();
        let (_, sspth) = halves(&req);
        fx.conn.delete(&sspth).await.unwrap();

        let err = get_state(fx.conn.as_ref(), &req).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_applies_to_both_halves() {
        let fx = Fixture::new().await;
        let req = fx.req(0);
        create_state(fx.conn.as_ref(), &req, "").await.unwrap();

        update_state(fx.conn.as_ref(), &req, |s| {
            s.host.desired_state = DesiredState::Pause;
            s.service.container_id = "abc".to_string();
            true
        })
        .await
        .unwrap();

        let state = get_state(fx.conn.as_ref(), &req).await.unwrap();
        assert_eq!(state.host.desired_state, DesiredState::Pause);
        assert_eq!(state.service.container_id, "abc");
    }

    #[tokio::test]
    async fn test_update_skipped_when_mutate_declines() {
        let fx = Fixture::new().await;
        let req = fx.req(0);
        create_state(fx.conn.as_ref(), &req, "").await.unwrap();
        let before = get_state(fx.conn.as_ref(), &req).await.unwrap();

        update_state(fx.conn.as_ref(), &req, |s| {
            s.host.desired_state = DesiredState::Stop;
            false
        })
        .await
        .unwrap();

        let after = get_state(fx.conn.as_ref(), &req).await.unwrap();
        assert_eq!(before.host.version, after.host.version);
        assert_eq!(after.host.desired_state, DesiredState::Run);
    }

    #[tokio::test]
    async fn test_update_detects_concurrent_write() {
        let fx = Fixture::new().await;
        let req = fx.req(0);
        create_state(fx.conn.as_ref(), &req, "").await.unwrap();

        let conn = Arc::clone(&fx.conn);
        let racer = req.clone();
        let err = update_state(fx.conn.as_ref(), &req, move |s| {
            // Another writer bumps the host half between read and write.
            let (hspth, _) = halves(&racer);
            let mut host = s.host.clone();
            block_on_other_thread(async move { conn.set(&hspth, &mut host).await.unwrap() });
            s.service.paused = true;
            true
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Conflict);
        assert!(err.is_transient());
        let state = get_state(fx.conn.as_ref(), &req).await.unwrap();
        assert!(!state.service.paused);
    }

    /// Drives a future to completion from inside a synchronous closure.
    fn block_on_other_thread<F: std::future::Future<Output = ()> + Send + 'static>(f: F) {
        let handle = tokio::runtime::Handle::current();
        std::thread::spawn(move || handle.block_on(f)).join().unwrap();
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let fx = Fixture::new().await;
        let req = fx.req(0);

        assert!(!delete_state(fx.conn.as_ref(), &req).await.unwrap());

        create_state(fx.conn.as_ref(), &req, "").await.unwrap();
        assert!(delete_state(fx.conn.as_ref(), &req).await.unwrap());
        assert_eq!(fx.halves_exist(&req).await, (false, false));
        assert!(!delete_state(fx.conn.as_ref(), &req).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_lone_half() {
        let fx = Fixture::new().await;
        let req = fx.req(3);
        let (hspth, _) = halves(&req);
        fx.conn.create_dir(&hspth).await.unwrap();

        assert!(!is_valid_state(fx.conn.as_ref(), &req).await.unwrap());
        assert!(delete_state(fx.conn.as_ref(), &req).await.unwrap());
        assert_eq!(fx.halves_exist(&req).await, (false, false));
    }

    #[tokio::test]
    async fn test_delete_surfaces_store_failure() {
        let fx = Fixture::new().await;
        let req = fx.req(0);
        fx.store.fail_next(CoordError::NoServer);

        let err = delete_state(fx.conn.as_ref(), &req).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Store(CoordError::NoServer));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_projections_skip_orphans_and_malformed_ids() {
        let fx = Fixture::new().await;
        for i in 0..3 {
            create_state(fx.conn.as_ref(), &fx.req(i), "").await.unwrap();
        }
        let (hspth, _) = halves(&fx.req(1));
        fx.conn.delete(&hspth).await.unwrap();
        fx.conn
            .create_dir(&shoal_coord::path::join(&[
                &paths::service(&fx.pool, &fx.service),
                "garbage",
            ]))
            .await
            .unwrap();

        let ids = get_service_state_ids(fx.conn.as_ref(), &fx.pool, &fx.service)
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);

        let mut states = get_service_states(fx.conn.as_ref(), &fx.pool, &fx.service)
            .await
            .unwrap();
        states.sort_by_key(|s| s.instance_id);
        let instances: Vec<_> = states.iter().map(|s| s.instance_id).collect();
        assert_eq!(instances, vec![0, 2]);

        let host_states = get_host_states(fx.conn.as_ref(), &fx.pool, &fx.host)
            .await
            .unwrap();
        assert_eq!(host_states.len(), 2);
    }

    #[tokio::test]
    async fn test_projections_on_missing_parent() {
        let fx = Fixture::new().await;
        let ids = get_host_state_ids(fx.conn.as_ref(), &fx.pool, &HostId::new())
            .await
            .unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_deletion() {
        let fx = Fixture::new().await;
        for i in 0..4 {
            create_state(fx.conn.as_ref(), &fx.req(i), "").await.unwrap();
        }
        update_state(fx.conn.as_ref(), &fx.req(0), |s| {
            s.host.desired_state = DesiredState::Stop;
            true
        })
        .await
        .unwrap();

        let stopped = delete_host_states_when(fx.conn.as_ref(), &fx.pool, &fx.host, |s| {
            s.host.desired_state == DesiredState::Stop
        })
        .await;
        assert_eq!(stopped, 1);

        assert_eq!(
            delete_service_states(fx.conn.as_ref(), &fx.pool, &fx.service).await,
            3
        );
        assert_eq!(
            delete_host_states(fx.conn.as_ref(), &fx.pool, &fx.host).await,
            0
        );
    }

    #[tokio::test]
    async fn test_clean_states_removes_orphans() {
        let fx = Fixture::new().await;
        let good = fx.req(0);
        let host_only = fx.req(1);
        let service_only = fx.req(2);
        create_state(fx.conn.as_ref(), &good, "").await.unwrap();
        fx.conn.create_dir(&halves(&host_only).0).await.unwrap();
        fx.conn.create_dir(&halves(&service_only).1).await.unwrap();
        let junk = shoal_coord::path::join(&[&paths::host_instances(&fx.pool, &fx.host), "junk"]);
        fx.conn.create_dir(&junk).await.unwrap();

        clean_host_states(fx.conn.as_ref(), &fx.pool, &fx.host)
            .await
            .unwrap();
        assert_eq!(fx.halves_exist(&host_only).await, (false, false));
        assert!(!fx.conn.exists(&junk).await.unwrap());
        assert_eq!(fx.halves_exist(&service_only).await, (false, true));

        clean_service_states(fx.conn.as_ref(), &fx.pool, &fx.service)
            .await
            .unwrap();
        assert_eq!(fx.halves_exist(&service_only).await, (false, false));
        assert_eq!(fx.halves_exist(&good).await, (true, true));
    }

    #[tokio::test]
    async fn test_monitor_state_until_check_passes() {
        let fx = Fixture::new().await;
        let req = fx.req(0);
        create_state(fx.conn.as_ref(), &req, "").await.unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let conn = Arc::clone(&fx.conn);
        let waiting = req.clone();
        let monitor = tokio::spawn(async move {
            monitor_state(conn.as_ref(), &waiting, cancel_rx, |s| {
                s.host.desired_state == DesiredState::Stop
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        update_state(fx.conn.as_ref(), &req, |s| {
            s.host.desired_state = DesiredState::Stop;
            true
        })
        .await
        .unwrap();

        let state = tokio::time::timeout(Duration::from_secs(1), monitor)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(state.host.desired_state, DesiredState::Stop);
    }

    #[tokio::test]
    async fn test_monitor_state_deleted_and_cancelled() {
        let fx = Fixture::new().await;
        let req = fx.req(0);
        create_state(fx.conn.as_ref(), &req, "").await.unwrap();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let conn = Arc::clone(&fx.conn);
        let waiting = req.clone();
        let cancelled = tokio::spawn(async move {
            monitor_state(conn.as_ref(), &waiting, cancel_rx, |_| false).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send(true).unwrap();
        assert_eq!(cancelled.await.unwrap().unwrap(), None);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let conn = Arc::clone(&fx.conn);
        let waiting = req.clone();
        let deleted = tokio::spawn(async move {
            monitor_state(conn.as_ref(), &waiting, cancel_rx, |_| false).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        delete_state(fx.conn.as_ref(), &req).await.unwrap();
        let err = deleted.await.unwrap().unwrap_err();
        assert!(err.is_not_found());
    }
}
