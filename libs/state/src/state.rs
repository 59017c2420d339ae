//! Instance state types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shoal_coord::{impl_node, Version};
use shoal_id::{HostId, PoolId, ServiceId};

use crate::InvalidStateId;

/// Run state requested for a service or one of its instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Run,
    Pause,
    Stop,
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Run => "run",
            Self::Pause => "pause",
            Self::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// Host half of an instance state: what the host agent should do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    pub desired_state: DesiredState,
    pub scheduled: DateTime<Utc>,
    #[serde(skip)]
    pub version: Option<Version>,
}

impl_node!(HostState);

impl HostState {
    /// A freshly scheduled instance.
    pub fn scheduled_now() -> Self {
        Self {
            desired_state: DesiredState::Run,
            scheduled: Utc::now(),
            version: None,
        }
    }
}

/// Service half of an instance state: what the host agent reports.
///
/// Unset timestamps are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub container_id: String,
    pub image_id: String,
    pub paused: bool,
    pub started: Option<DateTime<Utc>>,
    pub terminated: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub version: Option<Version>,
}

impl_node!(ServiceState);

impl ServiceState {
    /// Whether the container is believed to be running: started and not
    /// terminated since.
    pub fn is_running(&self) -> bool {
        match (self.started, self.terminated) {
            (Some(started), Some(terminated)) => started > terminated,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Both halves of an instance state with the key they were read under.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub host_id: HostId,
    pub service_id: ServiceId,
    pub instance_id: u32,
    pub host: HostState,
    pub service: ServiceState,
}

// =============================================================================
// Requests
// =============================================================================

/// Identifies one scheduled instance of a service on a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateRequest {
    pub pool_id: PoolId,
    pub host_id: HostId,
    pub service_id: ServiceId,
    pub instance_id: u32,
}

impl StateRequest {
    /// Node name shared by both halves: `{host}-{service}-{instance}`.
    pub fn state_id(&self) -> String {
        format!("{}-{}-{}", self.host_id, self.service_id, self.instance_id)
    }

    /// Builds a request from a state id found under `pool`.
    pub fn from_state_id(pool_id: &PoolId, state_id: &str) -> Result<Self, InvalidStateId> {
        let (host_id, service_id, instance_id) = parse_state_id(state_id)?;
        Ok(Self {
            pool_id: *pool_id,
            host_id,
            service_id,
            instance_id,
        })
    }
}

/// Splits `{host}-{service}-{instance}` into its parts.
pub fn parse_state_id(state_id: &str) -> Result<(HostId, ServiceId, u32), InvalidStateId> {
    let invalid = || InvalidStateId(state_id.to_string());

    let mut parts = state_id.split('-');
    let (Some(host), Some(service), Some(instance), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    if instance.is_empty() || !instance.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let host_id = HostId::parse(host).map_err(|_| invalid())?;
    let service_id = ServiceId::parse(service).map_err(|_| invalid())?;
    let instance_id = instance.parse().map_err(|_| invalid())?;
    Ok((host_id, service_id, instance_id))
}

/// Sorts requests by instance id.
pub fn sort_requests(reqs: &mut [StateRequest]) {
    reqs.sort_by_key(|r| r.instance_id);
}

// =============================================================================
// Tests
// =============================================================================
