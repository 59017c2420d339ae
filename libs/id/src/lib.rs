//! # shoal-id
//!
//! Typed identifiers for the shoal scheduler.
//!
//! ## ID Format
//!
//! All identifiers use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `pool_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `host_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `svc_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The format never contains `-` or `/`. Coordination-store node names are
//! built by joining identifiers with `-` (for example an instance state is
//! named `{host}-{service}-{instance}`), and a node name must never contain a
//! path separator, so both characters are reserved.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
