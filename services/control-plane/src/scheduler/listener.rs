//! Per-service reconciliation against the pool's scheduled instances.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shoal_coord::{Connection, ConnectionExt, CoordError};
use shoal_id::{HostId, PoolId, ServiceId};
use shoal_reconcile::{wait_for_shutdown, ConnectionSlot, RetryPolicy, Spawner};
use shoal_state::{
    clean_service_states, create_state, delete_state, is_host_locked, is_host_online, paths,
    sort_requests, update_state, ChangeOption, DesiredState, ServiceNode, StateError, StateRequest,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use super::{HostSelector, ListenerError};
use crate::Config;

/// Returns the `n` lowest instance ids not present in `existing`, which must
/// be sorted.
pub fn missing_instance_ids(existing: &[u32], n: usize) -> Vec<u32> {
    let mut missing = Vec::with_capacity(n);
    let mut taken = existing.iter().copied().peekable();
    let mut candidate = 0u32;
    while missing.len() < n {
        while taken.next_if(|&id| id < candidate).is_some() {}
        if taken.next_if_eq(&candidate).is_none() {
            missing.push(candidate);
        }
        candidate += 1;
    }
    missing
}

/// Reconciles every service in a pool, one task per service.
pub struct ServiceListener {
    pool: PoolId,
    selector: Arc<dyn HostSelector>,
    conn: ConnectionSlot,
    retry: Duration,
    stop_retry: RetryPolicy,
    /// Held across host selection and state creation so two services never
    /// place against the same stale view of a host.
    scheduling: Mutex<()>,
}

impl ServiceListener {
    pub fn new(pool: PoolId, selector: Arc<dyn HostSelector>, config: &Config) -> Self {
        Self {
            pool,
            selector,
            conn: ConnectionSlot::default(),
            retry: config.scheduler_retry,
            stop_retry: config.stop_retry.clone(),
            scheduling: Mutex::new(()),
        }
    }

    #[instrument(skip(self, cancel, conn), fields(pool_id = %self.pool))]
    async fn run(&self, cancel: &mut watch::Receiver<bool>, conn: &dyn Connection, service_id: ServiceId) {
        let path = paths::service(&self.pool, &service_id);
        let mut known: Vec<StateRequest> = Vec::new();

        loop {
            let (svc, service_watch) = match conn.get_w::<ServiceNode>(&path).await {
                Ok(found) => found,
                Err(CoordError::NoNode) => {
                    self.release(conn, &known).await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Could not load service");
                    return;
                }
            };

            if let Err(e) = clean_service_states(conn, &self.pool, &service_id).await {
                warn!(error = %e, "Could not clean up service states");
            }

            let (children, states_watch) = match conn.children_w(&path).await {
                Ok(found) => found,
                Err(CoordError::NoNode) => continue,
                Err(e) => {
                    warn!(error = %e, "Could not watch service states");
                    return;
                }
            };
            let reqs = self.requests(&service_id, &children);
            known.clone_from(&reqs);

            let ok = match svc.desired_state {
                DesiredState::Run => {
                    let (_, resumed) = self.resume(&reqs).await;
                    let (delta, synced) = self.sync(svc.locked, &svc, reqs).await;
                    if delta != 0 {
                        info!(delta, instances = svc.instances, "Synced service instances");
                    }
                    resumed && synced
                }
                DesiredState::Pause => self.pause(&reqs).await.1,
                DesiredState::Stop => self.stop(&reqs).await.1,
            };

            let retry = async {
                if ok {
                    std::future::pending::<()>().await;
                } else {
                    tokio::time::sleep(self.retry).await;
                }
            };

            tokio::select! {
                biased;

                _ = wait_for_shutdown(cancel) => {
                    debug!("Service listener stopping");
                    return;
                }
                event = service_watch.wait() => {
                    if event.is_session() {
                        return;
                    }
                }
                event = states_watch.wait() => {
                    if event.is_session() {
                        return;
                    }
                }
                _ = retry => debug!("Retrying service sync"),
            }
        }
    }

    /// Parses state ids scheduled under a service; foreign or malformed ids
    /// are left to orphan cleanup.
    fn requests(&self, service_id: &ServiceId, children: &[String]) -> Vec<StateRequest> {
        let mut reqs: Vec<_> = children
            .iter()
            .filter_map(|sid| match StateRequest::from_state_id(&self.pool, sid) {
                Ok(req) if req.service_id == *service_id => Some(req),
                _ => {
                    debug!(state_id = %sid, "Skipping malformed state id");
                    None
                }
            })
            .collect();
        sort_requests(&mut reqs);
        reqs
    }

    /// Drops the states of a deleted service. The service halves went with
    /// the service node; this removes the host halves so agents stop them.
    async fn release(&self, conn: &dyn Connection, known: &[StateRequest]) {
        let mut count = 0;
        for req in known {
            match delete_state(conn, req).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Could not release instance"),
            }
        }
        info!(count, "Service removed");
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Adds or stops instances so the service has as many as it asks for.
    ///
    /// Returns the change in instance count and whether every step worked.
    /// A locked service never gains instances.
    pub async fn sync(&self, locked: bool, svc: &ServiceNode, mut reqs: Vec<StateRequest>) -> (i64, bool) {
        sort_requests(&mut reqs);
        let count = reqs.len();
        let mut target = svc.instances as usize;

        if svc.has_option(ChangeOption::RestartAllOnInstanceChanged) && count > 0 && count != target {
            debug!(service_id = %svc.id, count, target, "Restarting all instances");
            target = 0;
        }
        if svc.has_option(ChangeOption::RestartAllOnInstanceZeroDown)
            && reqs.first().is_some_and(|r| r.instance_id != 0)
        {
            debug!(service_id = %svc.id, "Instance 0 is down, restarting all instances");
            target = 0;
        }

        if count < target {
            if locked {
                warn!(service_id = %svc.id, "Service is locked, not starting instances");
                return (0, true);
            }
            let existing: Vec<u32> = reqs.iter().map(|r| r.instance_id).collect();
            let mut started = 0i64;
            let mut ok = true;
            for instance_id in missing_instance_ids(&existing, target - count) {
                if self.start(svc, instance_id).await {
                    started += 1;
                } else {
                    ok = false;
                }
            }
            (started, ok)
        } else if count > target {
            let excess = &reqs[target..];
            let (_, ok) = self.stop(excess).await;
            (-(excess.len() as i64), ok)
        } else {
            (0, true)
        }
    }

    /// Places a new instance and schedules it. Returns false if no state was
    /// created.
    pub async fn start(&self, svc: &ServiceNode, instance_id: u32) -> bool {
        match self.place(svc, instance_id).await {
            Ok(host_id) => {
                debug!(service_id = %svc.id, instance_id, host_id = %host_id, "Scheduled instance");
                true
            }
            Err(e) => {
                warn!(service_id = %svc.id, instance_id, error = %e, "Could not schedule instance");
                false
            }
        }
    }

    async fn place(&self, svc: &ServiceNode, instance_id: u32) -> Result<HostId, ListenerError> {
        let conn = self.conn.get()?;
        let _scheduling = self.scheduling.lock().await;

        let host_id = self.selector.select_host(svc).await?;
        if !is_host_online(conn.as_ref(), &self.pool, &host_id).await? {
            return Err(ListenerError::HostOffline(host_id));
        }
        if is_host_locked(conn.as_ref(), &self.pool, &host_id).await? {
            return Err(ListenerError::HostLocked(host_id));
        }

        let req = StateRequest {
            pool_id: self.pool,
            host_id,
            service_id: svc.id,
            instance_id,
        };
        delete_state(conn.as_ref(), &req).await?;
        create_state(conn.as_ref(), &req, &svc.image_id).await?;
        Ok(host_id)
    }

    // =========================================================================
    // Desired State
    // =========================================================================

    /// Asks each instance to stop. Instances on offline hosts are deleted
    /// outright since no agent will act on them.
    ///
    /// Returns how many stored states were affected and whether every
    /// request succeeded. Requests with no stored state succeed without
    /// being counted.
    pub async fn stop(&self, reqs: &[StateRequest]) -> (usize, bool) {
        let conn = match self.conn.get() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "No connection to stop instances");
                return (0, false);
            }
        };

        let mut count = 0;
        let mut ok = true;
        for req in reqs {
            match self.stop_one(conn.as_ref(), req).await {
                Ok(true) => count += 1,
                Ok(false) => debug!(state_id = %req.state_id(), "No state to stop"),
                Err(e) => {
                    warn!(error = %e, "Could not stop instance");
                    ok = false;
                }
            }
        }
        (count, ok)
    }

    /// Returns false if there was no state to stop.
    async fn stop_one(&self, conn: &dyn Connection, req: &StateRequest) -> Result<bool, ListenerError> {
        if !is_host_online(conn, &req.pool_id, &req.host_id).await? {
            let found = delete_state(conn, req).await?;
            debug!(state_id = %req.state_id(), found, "Host is offline, deleted state");
            return Ok(found);
        }

        let stopped = self
            .stop_retry
            .run(
                || {
                    update_state(conn, req, |s| {
                        if s.host.desired_state == DesiredState::Stop {
                            return false;
                        }
                        s.host.desired_state = DesiredState::Stop;
                        true
                    })
                },
                StateError::is_transient,
            )
            .await;

        match stopped {
            // Half a state is nothing an agent can stop.
            Err(e) if e.is_not_found() => Ok(delete_state(conn, req).await?),
            Err(e) => Err(e.into()),
            Ok(()) => Ok(true),
        }
    }

    /// Pauses running instances. Instances in any other state count as done.
    pub async fn pause(&self, reqs: &[StateRequest]) -> (usize, bool) {
        self.transition(reqs, DesiredState::Run, DesiredState::Pause).await
    }

    /// Resumes paused instances. Instances in any other state count as done.
    pub async fn resume(&self, reqs: &[StateRequest]) -> (usize, bool) {
        self.transition(reqs, DesiredState::Pause, DesiredState::Run).await
    }

    async fn transition(&self, reqs: &[StateRequest], from: DesiredState, to: DesiredState) -> (usize, bool) {
        let conn = match self.conn.get() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "No connection to update instances");
                return (0, false);
            }
        };

        let mut count = 0;
        let mut ok = true;
        for req in reqs {
            let updated = update_state(conn.as_ref(), req, |s| {
                if s.host.desired_state != from {
                    return false;
                }
                s.host.desired_state = to;
                true
            })
            .await;
            match updated {
                Ok(()) => count += 1,
                Err(e) => {
                    warn!(error = %e, desired_state = %to, "Could not update instance");
                    ok = false;
                }
            }
        }
        (count, ok)
    }
}

#[async_trait]
impl Spawner for ServiceListener {
    fn set_connection(&self, conn: Arc<dyn Connection>) {
        self.conn.set(conn);
    }

    fn path(&self) -> String {
        paths::services(&self.pool)
    }

    async fn spawn(&self, mut cancel: watch::Receiver<bool>, child: String) {
        let Ok(service_id) = ServiceId::parse(&child) else {
            debug!(child = %child, "Ignoring node that is not a service");
            return;
        };
        let conn = match self.conn.get() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "No connection for service");
                return;
            }
        };
        self.run(&mut cancel, conn.as_ref(), service_id).await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty(&[], 3, &[0, 1, 2])]
    #[case::fills_gaps_first(&[0, 1, 4, 5], 1, &[2])]
    #[case::gaps_then_append(&[1, 3], 3, &[0, 2, 4])]
    #[case::dense(&[0, 1, 2], 2, &[3, 4])]
    #[case::none_needed(&[0, 2], 0, &[])]
    fn test_missing_instance_ids(#[case] existing: &[u32], #[case] n: usize, #[case] expected: &[u32]) {
        assert_eq!(missing_instance_ids(existing, n), expected);
    }

    proptest! {
        #[test]
        fn prop_missing_ids_are_lowest_unused(
            existing in proptest::collection::btree_set(0u32..64, 0..32),
            n in 0usize..16,
        ) {
            let existing: Vec<u32> = existing.into_iter().collect();
            let missing = missing_instance_ids(&existing, n);

            prop_assert_eq!(missing.len(), n);
            prop_assert!(missing.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(missing.iter().all(|id| !existing.contains(id)));
            if let Some(&highest) = missing.last() {
                // Every id below the highest pick is either taken or picked.
                for id in 0..highest {
                    prop_assert!(existing.contains(&id) || missing.contains(&id));
                }
            }
        }
    }
}
