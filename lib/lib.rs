//! inocache shared library.
//!
//! A handle-keyed metadata cache for NFS-style file servers, with a per-file byte-range lock
//! manager layered on top of it.

pub mod backend;
/// The handle-keyed entry cache and its garbage collector.
pub mod cache;
pub mod config;
pub mod error;
/// Byte-range locking over cached regular files.
pub mod lock;
pub mod registry;
pub mod trc;
pub mod ward;

pub use backend::{Attributes, Backend, BackendHandle, EntryType, LockOp, LockSupport};
pub use cache::{EntryCache, EntryHandle, GarbageCollector, HandleKey};
pub use config::CacheConfig;
pub use error::{BackendError, CacheError};
pub use lock::{LockDescriptor, LockManager, LockOwner, LockType};
pub use registry::StateRegistry;
