//! The filesystem backend the cache sits in front of.
//!
//! The cache never talks to storage directly. Everything it needs from the underlying filesystem
//! goes through [`Backend`]: attribute fetches, handle digests, byte-range lock down-calls and
//! the open/close lifecycle of cached descriptors.

use std::{fmt, future::Future, time::SystemTime};

use bytes::Bytes;

use crate::{error::BackendError, lock::LockDescriptor, lock::LockOwner};

/// Opaque wire handle of a backend object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendHandle(pub Bytes);

impl BackendHandle {
    /// Wrap raw handle bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The raw handle bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter().take(16) {
            write!(f, "{b:02x}")?;
        }
        if self.0.len() > 16 {
            f.write_str("..")?;
        }
        Ok(())
    }
}

/// Object types the cache distinguishes. Fixed for the lifetime of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// A regular file. Only regular files carry locks and descriptors.
    RegularFile,
    /// A directory.
    Directory,
    /// A symbolic link.
    SymbolicLink,
    /// A unix domain socket.
    Socket,
    /// A named pipe.
    Fifo,
    /// A block device node.
    BlockDevice,
    /// A character device node.
    CharDevice,
    /// A crossing into another export.
    Junction,
}

impl EntryType {
    /// Whether this is a directory.
    #[must_use]
    pub fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }

    /// Whether this is a regular file.
    #[must_use]
    pub fn is_file(self) -> bool {
        matches!(self, Self::RegularFile)
    }
}

/// Attribute snapshot fetched from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    /// Object type.
    pub entry_type: EntryType,
    /// Backend file id.
    pub fileid: u64,
    /// Size in bytes.
    pub size: u64,
    /// Bytes of storage consumed.
    pub space_used: u64,
    /// Permission bits.
    pub mode: u32,
    /// Hard link count.
    pub nlink: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Last data modification.
    pub mtime: SystemTime,
    /// Last metadata change.
    pub ctime: SystemTime,
}

impl Attributes {
    /// Attributes with the given type and file id, everything else zeroed.
    #[must_use]
    pub fn new(entry_type: EntryType, fileid: u64) -> Self {
        Self {
            entry_type,
            fileid,
            size: 0,
            space_used: 0,
            mode: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
        }
    }
}

/// How much of byte-range locking the backend implements itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockSupport {
    /// No backend locking; the cache is the only lock authority.
    None,
    /// Backend locks exist but are not owner-aware. Overlapping locks from different owners must
    /// not be pushed down, and unlocks must skip ranges other owners still hold.
    NoOwner,
    /// Backend tracks lock ownership itself.
    Owner,
}

/// Lock down-call operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    /// Acquire a lock.
    Lock,
    /// Release a range.
    Unlock,
    /// Probe for a conflict without acquiring.
    Test,
}

/// The filesystem below the cache.
pub trait Backend: Clone + Send + Sync + 'static {
    /// Open-file state kept by the descriptor cache.
    type Descriptor: Send + Sync + 'static;

    /// Fetch the current attributes of `handle`.
    ///
    /// Must fail with [`BackendError::Stale`] when the object no longer exists.
    fn fetch_attributes(
        &self,
        handle: &BackendHandle,
    ) -> impl Future<Output = Result<Attributes, BackendError>> + Send;

    /// Produce the canonical digest used as the cache key for `handle`.
    fn digest_handle(&self, handle: &BackendHandle) -> Bytes;

    /// What lock down-calls this backend accepts.
    fn lock_support(&self) -> LockSupport;

    /// Perform a lock down-call.
    ///
    /// `owner` is `None` for backends with [`LockSupport::NoOwner`].
    fn lock_op(
        &self,
        handle: &BackendHandle,
        owner: Option<&LockOwner>,
        op: LockOp,
        descriptor: LockDescriptor,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Open a descriptor for a regular file.
    fn open(
        &self,
        handle: &BackendHandle,
    ) -> impl Future<Output = Result<Self::Descriptor, BackendError>> + Send;

    /// Close a descriptor previously returned by [`Backend::open`].
    fn close(
        &self,
        descriptor: Self::Descriptor,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Release any per-handle resources once the cache has reclaimed the entry.
    fn forget(&self, _handle: &BackendHandle) {}
}
