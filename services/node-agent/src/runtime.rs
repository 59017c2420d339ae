//! In-memory handlers for testing and development.
//!
//! [`MockContainerHandler`] keeps a table of fake containers and lets a test
//! crash one to simulate an unsolicited exit. [`MockIpHandler`] records which
//! addresses are bound.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shoal_id::ServiceId;
use shoal_state::ServiceState;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use crate::handler::{ContainerHandler, ExitNotification, HandlerError, IpBindHandler};

struct MockContainer {
    id: String,
    paused: bool,
    waiters: Vec<oneshot::Sender<DateTime<Utc>>>,
}

impl MockContainer {
    fn exit(self) {
        let at = Utc::now();
        for waiter in self.waiters {
            let _ = waiter.send(at);
        }
    }
}

/// Mock container runtime.
pub struct MockContainerHandler {
    /// Counter for generating container ids.
    counter: AtomicU64,

    /// Whether containers should "fail" to start.
    fail_starts: AtomicBool,

    containers: Mutex<HashMap<(ServiceId, u32), MockContainer>>,
}

impl MockContainerHandler {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            fail_starts: AtomicBool::new(false),
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Makes every later start fail.
    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Containers started so far.
    pub fn starts(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Kills a container without being asked to. Returns false if none ran.
    pub fn crash(&self, service: &ServiceId, instance: u32) -> bool {
        match self.table().remove(&(*service, instance)) {
            Some(container) => {
                info!(service_id = %service, instance, "[MOCK] Container crashed");
                container.exit();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, service: &ServiceId, instance: u32) -> bool {
        self.table().contains_key(&(*service, instance))
    }

    pub fn is_paused(&self, service: &ServiceId, instance: u32) -> bool {
        self.table()
            .get(&(*service, instance))
            .is_some_and(|c| c.paused)
    }

    /// Number of live containers.
    pub fn running(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<(ServiceId, u32), MockContainer>> {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_paused(&self, service: &ServiceId, instance: u32, paused: bool) {
        if let Some(container) = self.table().get_mut(&(*service, instance)) {
            container.paused = paused;
        }
    }
}

impl Default for MockContainerHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerHandler for MockContainerHandler {
    async fn attach_container(
        &self,
        state: &ServiceState,
        service: &ServiceId,
        instance: u32,
    ) -> Result<Option<ExitNotification>, HandlerError> {
        let mut table = self.table();
        let Some(container) = table.get_mut(&(*service, instance)) else {
            return Ok(None);
        };
        if container.id != state.container_id {
            debug!(container_id = %container.id, "[MOCK] Container does not match state");
            return Ok(None);
        }
        let (tx, exit) = ExitNotification::channel();
        container.waiters.push(tx);
        debug!(container_id = %container.id, "[MOCK] Attached to container");
        Ok(Some(exit))
    }

    async fn start_container(
        &self,
        cancel: watch::Receiver<bool>,
        service: &ServiceId,
        instance: u32,
    ) -> Result<(ServiceState, ExitNotification), HandlerError> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(HandlerError::Runtime("mock runtime configured to fail".to_string()));
        }
        if *cancel.borrow() {
            return Err(HandlerError::Cancelled);
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("ctr_{n:016x}");
        let (tx, exit) = ExitNotification::channel();
        let previous = self.table().insert(
            (*service, instance),
            MockContainer {
                id: id.clone(),
                paused: false,
                waiters: vec![tx],
            },
        );
        if let Some(previous) = previous {
            previous.exit();
        }
        info!(service_id = %service, instance, container_id = %id, "[MOCK] Started container");

        let state = ServiceState {
            container_id: id,
            started: Some(Utc::now()),
            ..ServiceState::default()
        };
        Ok((state, exit))
    }

    async fn pause_container(&self, service: &ServiceId, instance: u32) -> Result<(), HandlerError> {
        self.set_paused(service, instance, true);
        Ok(())
    }

    async fn resume_container(&self, service: &ServiceId, instance: u32) -> Result<(), HandlerError> {
        self.set_paused(service, instance, false);
        Ok(())
    }

    async fn stop_container(&self, service: &ServiceId, instance: u32) -> Result<(), HandlerError> {
        if let Some(container) = self.table().remove(&(*service, instance)) {
            info!(service_id = %service, instance, container_id = %container.id, "[MOCK] Stopped container");
            container.exit();
        }
        Ok(())
    }
}

/// Mock address binder.
#[derive(Default)]
pub struct MockIpHandler {
    bound: Mutex<BTreeMap<String, (String, String)>>,
    fail_binds: Mutex<HashSet<String>>,
}

impl MockIpHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses currently bound.
    pub fn bound(&self) -> Vec<String> {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Makes binding `ip` fail until cleared.
    pub fn fail_bind(&self, ip: &str, fail: bool) {
        let mut failing = self.fail_binds.lock().unwrap_or_else(PoisonError::into_inner);
        if fail {
            failing.insert(ip.to_string());
        } else {
            failing.remove(ip);
        }
    }
}

#[async_trait]
impl IpBindHandler for MockIpHandler {
    async fn bind_ip(&self, ip: &str, netmask: &str, interface: &str) -> Result<(), HandlerError> {
        if self
            .fail_binds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(ip)
        {
            return Err(HandlerError::Runtime(format!("cannot bind {ip}")));
        }
        debug!(ip, netmask, interface, "[MOCK] Bound ip");
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ip.to_string(), (netmask.to_string(), interface.to_string()));
        Ok(())
    }

    async fn release_ip(&self, ip: &str) -> Result<(), HandlerError> {
        debug!(ip, "[MOCK] Released ip");
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(ip);
        Ok(())
    }
}
