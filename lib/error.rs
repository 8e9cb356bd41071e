//! Error types shared by the entry cache and the lock manager.

use std::sync::Arc;

use thiserror::Error;

use crate::lock::{LockDescriptor, LockOwner};

/// Errors reported by a [`Backend`](crate::backend::Backend).
///
/// A vanished handle is reported through [`BackendError::Stale`] and nothing else, so that the
/// cache can tell it apart from transient failures.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The object behind the handle no longer exists.
    #[error("stale backend handle")]
    Stale,

    /// The backend refused a lock because it already holds a conflicting one.
    #[error("backend lock conflict on {0}")]
    LockConflict(LockDescriptor),

    /// The backend does not implement the requested operation.
    #[error("operation not supported by backend")]
    NotSupported,

    /// Any other I/O failure.
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A conflicting lock reported to the caller.
///
/// `holder` is `None` when the conflict was reported by the backend, which cannot say who owns
/// the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictWitness {
    /// Owner of the conflicting lock, when known.
    pub holder: Option<Arc<LockOwner>>,
    /// Range and type of the conflicting lock.
    pub descriptor: LockDescriptor,
}

/// Errors returned by cache and lock operations.
///
/// A failed operation never leaves partial changes behind.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The requested object is not cached.
    #[error("entry not found")]
    NotFound,

    /// The operation does not apply to this entry type.
    #[error("operation not valid for this entry type")]
    BadType,

    /// An entry or directory entry with this key already exists.
    #[error("entry already exists")]
    AlreadyExists,

    /// A lock request conflicts with an existing lock.
    #[error("lock conflict with {:?} on {}", .0.holder, .0.descriptor)]
    Conflict(ConflictWitness),

    /// A bookkeeping structure could not grow.
    #[error("allocation failure")]
    AllocationFailure,

    /// The backend reported that the handle is gone. The entry has been marked stale.
    #[error("stale handle")]
    BackendStale,

    /// A transient or unexpected backend failure.
    #[error("backend error: {0}")]
    Backend(BackendError),

    /// The request is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A share reservation clashes with another owner's access or deny mode.
    #[error("share reservation denied")]
    ShareDenied,

    /// The backend cannot perform the operation.
    #[error("operation not supported")]
    NotSupported,

    /// Only reclaim requests are accepted while the grace period is active.
    #[error("server is in its grace period")]
    InGrace,

    /// A reclaim request arrived outside of the grace period.
    #[error("reclaim outside of the grace period")]
    NoGrace,
}

impl From<BackendError> for CacheError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Stale => Self::BackendStale,
            BackendError::LockConflict(descriptor) => Self::Conflict(ConflictWitness {
                holder: None,
                descriptor,
            }),
            BackendError::NotSupported => Self::NotSupported,
            other @ BackendError::Io(_) => Self::Backend(other),
        }
    }
}
