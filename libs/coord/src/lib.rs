//! # shoal-coord
//!
//! Client-side contract for the hierarchical coordination store that the
//! scheduler and host agents rendezvous through, plus the recipes built on it.
//!
//! ## Model
//!
//! - The store is a tree of versioned nodes addressed by `/`-separated paths.
//! - Nodes may be ephemeral (removed when the creating session ends) and
//!   sequential (named with a monotonically increasing suffix).
//! - Watches fire once. A [`Watch`] is consumed when awaited, so every pass
//!   of a reconciliation loop arms fresh watches.
//! - A [`Transaction`] applies all of its operations or none of them.
//!
//! ## Modules
//!
//! - `conn`: the [`Connection`] driver trait and typed [`ConnectionExt`] helpers
//! - `lock`: [`Lock`] and [`Leader`] recipes over sequential ephemeral nodes
//! - `rwlock`: reader/writer [`RwLock`] recipe
//! - `memory`: an in-process driver used by tests and single-process setups
//! - `registry`: [`ConnectionRegistry`] caching one connection per root path

mod conn;
mod error;
mod lock;
pub mod memory;
mod node;
pub mod path;
mod registry;
mod rwlock;
mod txn;
mod watch;

pub use conn::{Connection, ConnectionExt};
pub use error::{CoordError, CoordResult};
pub use lock::{current_leader, Leader, Lock};
pub use node::{Dir, Node, Version};
pub use registry::{ConnectionRegistry, Driver};
pub use rwlock::RwLock;
pub use txn::{Op, Transaction};
pub use watch::{Event, EventKind, Watch, WatchTrigger};
