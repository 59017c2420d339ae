//! shoal node agent library.
//!
//! The node agent runs on every host in a pool and converges the host onto
//! what the scheduler asked of it:
//!
//! ```text
//! HostStateListener        (one task per scheduled instance)
//! └── ContainerHandler     (attach / start / pause / resume / stop)
//! HostIpListener           (one task per assigned virtual IP)
//! └── IpBindHandler        (bind / release)
//! ```
//!
//! Both listeners are driven by [`shoal_reconcile::manage`] against a
//! connection rooted at the store root. The embedding daemon supplies the
//! store driver and the real handlers, loads [`Config::from_env`] and calls
//! [`telemetry::init`] before it starts them.
//!
//! ## Modules
//!
//! - `handler`: Traits the agent drives containers and addresses through
//! - `host_state`: Per-instance state machine
//! - `host_ip`: Per-address binding tasks
//! - `runtime`: In-memory handlers for tests and development

pub mod config;
pub mod handler;
pub mod host_ip;
pub mod host_state;
pub mod runtime;
pub mod telemetry;

pub use config::Config;
pub use handler::{ContainerHandler, ExitNotification, HandlerError, IpBindHandler};
pub use host_ip::HostIpListener;
pub use host_state::HostStateListener;
pub use runtime::{MockContainerHandler, MockIpHandler};
