//! Errors from paired-record operations.

use shoal_coord::CoordError;
use thiserror::Error;

use crate::{IpRequest, StateRequest};

/// What went wrong with a paired record.
///
/// Callers generally branch only on [`ErrorKind::NotFound`]; the other kinds
/// exist for logs and for retry decisions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("version conflict")]
    Conflict,

    #[error("invalid state id")]
    InvalidStateId,

    #[error("store error: {0}")]
    Store(CoordError),
}

impl From<CoordError> for ErrorKind {
    fn from(e: CoordError) -> Self {
        match e {
            CoordError::NoNode => Self::NotFound,
            CoordError::NodeExists => Self::AlreadyExists,
            CoordError::BadVersion => Self::Conflict,
            other => Self::Store(other),
        }
    }
}

impl From<StateError> for CoordError {
    fn from(e: StateError) -> Self {
        match e.kind {
            ErrorKind::NotFound => Self::NoNode,
            ErrorKind::AlreadyExists => Self::NodeExists,
            ErrorKind::Conflict => Self::BadVersion,
            ErrorKind::InvalidStateId => Self::InvalidPath(e.request.state_id()),
            ErrorKind::Store(inner) => inner,
        }
    }
}

impl ErrorKind {
    /// Returns true for failures that may clear up on their own: a lost
    /// optimistic race or a briefly unreachable server.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict | Self::Store(CoordError::NoServer))
    }
}

/// Failure of an instance state operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error(
    "could not {op} instance {} of service {} on host {}: {kind}",
    request.instance_id,
    request.service_id,
    request.host_id
)]
pub struct StateError {
    pub op: &'static str,
    pub request: StateRequest,
    pub kind: ErrorKind,
}

impl StateError {
    pub(crate) fn new(op: &'static str, request: &StateRequest, kind: impl Into<ErrorKind>) -> Self {
        Self {
            op,
            request: request.clone(),
            kind: kind.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Failure of an IP binding operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("could not {op} ip {} on host {}: {kind}", request.ip, request.host_id)]
pub struct IpError {
    pub op: &'static str,
    pub request: IpRequest,
    pub kind: ErrorKind,
}

impl IpError {
    pub(crate) fn new(op: &'static str, request: &IpRequest, kind: impl Into<ErrorKind>) -> Self {
        Self {
            op,
            request: request.clone(),
            kind: kind.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

/// A node name that does not split into its composite key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid state id: {0}")]
pub struct InvalidStateId(pub String);

impl From<InvalidStateId> for ErrorKind {
    fn from(_: InvalidStateId) -> Self {
        Self::InvalidStateId
    }
}
