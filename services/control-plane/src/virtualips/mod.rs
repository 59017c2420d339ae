//! Virtual IP assignment.
//!
//! Declarations live under `/pools/{pool}/virtualips`. The
//! [`AssignmentListener`] diffs them against the bindings under
//! `/pools/{pool}/ips` and asks an [`AssignmentHandler`] to assign what is
//! missing and unassign what is no longer declared.

mod assignment;
mod hosts;
mod listener;

use shoal_coord::CoordError;
use shoal_id::HostId;
use shoal_state::IpError;
use thiserror::Error;

pub use assignment::{AssignmentHandler, StoreAssignmentHandler};
pub use hosts::{HostProvider, OnlineHostProvider};
pub use listener::AssignmentListener;

#[derive(Debug, Error)]
pub enum AssignmentError {
    #[error("ip {ip} is already assigned to host {host}")]
    AlreadyAssigned { ip: String, host: HostId },

    #[error("no hosts available")]
    NoHosts,

    #[error("ip {0} is not assigned to any host")]
    NoAssignedHost(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Ip(#[from] IpError),

    #[error("store error: {0}")]
    Store(#[from] CoordError),
}
