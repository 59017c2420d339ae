//! shoal control plane.
//!
//! Two reconciliation loops run against a pool in the coordination store:
//!
//! - [`scheduler::ServiceListener`] keeps each service's scheduled instances
//!   in line with its instance count and desired state.
//! - [`virtualips::AssignmentListener`] keeps every declared virtual IP bound
//!   to exactly one online host.
//!
//! Both are meant to be driven by [`shoal_reconcile::manage`] from a daemon
//! that owns the connection registry. That daemon loads [`Config::from_env`]
//! and calls [`telemetry::init`] with its `log_level` before starting either
//! loop; this crate ships no binary of its own since the store driver is
//! chosen by the embedder.

pub mod config;
pub mod scheduler;
pub mod telemetry;
pub mod virtualips;

pub use config::Config;
