//! Cached objects.

use std::{
    fmt,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicUsize, Ordering},
    },
};

use tokio::{
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Instant,
};

use super::{
    dirents::DirIndex,
    key::{EntryId, HandleKey},
};
use crate::{
    backend::{Attributes, Backend, BackendHandle, EntryType},
    error::CacheError,
    lock::{LockList, ShareTable},
};

/// How far an entry can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Validity {
    /// Attributes and payload reflect the backend.
    Valid = 0,
    /// The backend reported the handle gone.
    Stale = 1,
    /// Dropped by the cache owner; reclaimed once no holder remains.
    Invalid = 2,
    /// Removed from the cache. Outstanding holders keep the memory alive only.
    Recycled = 3,
}

impl Validity {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Valid,
            1 => Self::Stale,
            2 => Self::Invalid,
            _ => Self::Recycled,
        }
    }
}

/// Bookkeeping timestamps of an entry.
#[derive(Debug, Clone, Copy)]
pub struct EntryTimes {
    /// When the entry was created.
    pub alloc: Instant,
    /// Last validation for a read.
    pub read: Instant,
    /// Last validation for a modification.
    pub modified: Instant,
    /// When the attributes were last fetched or set.
    pub refresh: Instant,
}

impl EntryTimes {
    fn now() -> Self {
        let now = Instant::now();
        Self {
            alloc: now,
            read: now,
            modified: now,
            refresh: now,
        }
    }

    /// The later of the read and modification stamps.
    #[must_use]
    pub fn last_use(&self) -> Instant {
        self.read.max(self.modified)
    }
}

/// Back-reference from a child to one dirent naming it. Never owns the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    /// Cache key of the parent directory.
    pub parent: HandleKey,
    /// Cookie of the dirent within the parent.
    pub cookie: u64,
}

/// A descriptor kept open between uses.
#[derive(Debug)]
pub struct OpenDescriptor<D> {
    /// The backend descriptor.
    pub descriptor: D,
    /// Last time it was handed out.
    pub last_used: Instant,
}

/// Regular file payload.
pub struct FilePayload<B: Backend> {
    /// Byte-range locks and pending requests.
    pub locks: LockList,
    /// Share reservations of opens.
    pub shares: ShareTable,
    /// Cached backend descriptor.
    pub descriptor: Option<OpenDescriptor<B::Descriptor>>,
}

impl<B: Backend> Default for FilePayload<B> {
    fn default() -> Self {
        Self {
            locks: LockList::new(),
            shares: ShareTable::default(),
            descriptor: None,
        }
    }
}

/// Type-specific part of an entry.
pub enum Payload<B: Backend> {
    /// Regular file.
    File(FilePayload<B>),
    /// Directory.
    Directory(DirIndex),
    /// Anything else.
    Other,
}

impl<B: Backend> fmt::Debug for FilePayload<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePayload")
            .field("locks", &self.locks)
            .field("shares", &self.shares)
            .field("descriptor_open", &self.descriptor.is_some())
            .finish()
    }
}

impl<B: Backend> fmt::Debug for Payload<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(file) => f.debug_tuple("File").field(file).finish(),
            Self::Directory(dir) => f.debug_tuple("Directory").field(dir).finish(),
            Self::Other => f.write_str("Other"),
        }
    }
}

impl<B: Backend> Payload<B> {
    fn for_type(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::RegularFile => Self::File(FilePayload::default()),
            EntryType::Directory => Self::Directory(DirIndex::default()),
            _ => Self::Other,
        }
    }
}

/// Mutable state of an entry, guarded by its lifecycle lock.
pub struct EntryState<B: Backend> {
    /// Last attribute snapshot.
    pub attributes: Attributes,
    /// Bookkeeping timestamps.
    pub times: EntryTimes,
    /// Type-specific payload.
    pub payload: Payload<B>,
    pub(crate) parent_links: Vec<ParentLink>,
}

impl<B: Backend> fmt::Debug for EntryState<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryState")
            .field("attributes", &self.attributes)
            .field("times", &self.times)
            .field("payload", &self.payload)
            .field("parent_links", &self.parent_links)
            .finish()
    }
}

impl<B: Backend> EntryState<B> {
    /// File payload, or `BadType`.
    pub fn file(&self) -> Result<&FilePayload<B>, CacheError> {
        match &self.payload {
            Payload::File(file) => Ok(file),
            _ => Err(CacheError::BadType),
        }
    }

    /// Mutable file payload, or `BadType`.
    pub fn file_mut(&mut self) -> Result<&mut FilePayload<B>, CacheError> {
        match &mut self.payload {
            Payload::File(file) => Ok(file),
            _ => Err(CacheError::BadType),
        }
    }

    /// Directory index, or `BadType`.
    pub fn dir(&self) -> Result<&DirIndex, CacheError> {
        match &self.payload {
            Payload::Directory(dir) => Ok(dir),
            _ => Err(CacheError::BadType),
        }
    }

    /// Mutable directory index, or `BadType`.
    pub fn dir_mut(&mut self) -> Result<&mut DirIndex, CacheError> {
        match &mut self.payload {
            Payload::Directory(dir) => Ok(dir),
            _ => Err(CacheError::BadType),
        }
    }

    /// Dirents in other directories that name this entry.
    #[must_use]
    pub fn parent_links(&self) -> &[ParentLink] {
        &self.parent_links
    }

    /// Whether locks or share reservations pin this entry in the cache.
    #[must_use]
    pub fn holds_state(&self) -> bool {
        match &self.payload {
            Payload::File(file) => !file.locks.is_empty() || !file.shares.is_empty(),
            _ => false,
        }
    }
}

/// One cached backend object.
///
/// The type, key and handle never change. Everything else sits behind the lifecycle lock;
/// validity is mirrored in an atomic so scans can read it without locking, but it is only
/// written with the lock held for writing.
pub struct CacheEntry<B: Backend> {
    id: EntryId,
    key: HandleKey,
    handle: BackendHandle,
    entry_type: EntryType,
    validity: AtomicU8,
    holders: AtomicUsize,
    state: RwLock<EntryState<B>>,
}

impl<B: Backend> fmt::Debug for CacheEntry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("entry_type", &self.entry_type)
            .field("validity", &self.validity())
            .field("holders", &self.holders())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> CacheEntry<B> {
    pub(crate) fn new(
        id: EntryId,
        key: HandleKey,
        handle: BackendHandle,
        attributes: Attributes,
    ) -> Self {
        let entry_type = attributes.entry_type;
        Self {
            id,
            key,
            handle,
            entry_type,
            validity: AtomicU8::new(Validity::Valid as u8),
            holders: AtomicUsize::new(0),
            state: RwLock::new(EntryState {
                attributes,
                times: EntryTimes::now(),
                payload: Payload::for_type(entry_type),
                parent_links: Vec::new(),
            }),
        }
    }

    /// Process-unique id.
    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Cache key.
    #[must_use]
    pub fn key(&self) -> &HandleKey {
        &self.key
    }

    /// Backend handle.
    #[must_use]
    pub fn handle(&self) -> &BackendHandle {
        &self.handle
    }

    /// Object type, fixed at creation.
    #[must_use]
    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    /// Current validity.
    #[must_use]
    pub fn validity(&self) -> Validity {
        Validity::from_u8(self.validity.load(Ordering::Acquire))
    }

    /// Write the validity. The caller holds the write lock.
    pub(crate) fn set_validity(&self, validity: Validity) {
        self.validity.store(validity as u8, Ordering::Release);
    }

    /// Number of outstanding [`EntryHandle`]s.
    #[must_use]
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    /// Take the lifecycle lock for reading.
    pub async fn read(&self) -> RwLockReadGuard<'_, EntryState<B>> {
        self.state.read().await
    }

    /// Take the lifecycle lock for writing.
    pub async fn write(&self) -> RwLockWriteGuard<'_, EntryState<B>> {
        self.state.write().await
    }
}

/// A counted reference to a cached entry.
///
/// While any handle is alive the garbage collector leaves the entry alone.
pub struct EntryHandle<B: Backend> {
    entry: Arc<CacheEntry<B>>,
}

impl<B: Backend> EntryHandle<B> {
    /// Count a new holder of `entry`.
    pub(crate) fn acquire(entry: &Arc<CacheEntry<B>>) -> Self {
        entry.holders.fetch_add(1, Ordering::AcqRel);
        Self {
            entry: Arc::clone(entry),
        }
    }

    /// The shared entry, without counting a holder.
    pub(crate) fn entry(&self) -> &Arc<CacheEntry<B>> {
        &self.entry
    }

    /// Whether both handles refer to the same cached object.
    #[must_use]
    pub fn same_entry(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl<B: Backend> Clone for EntryHandle<B> {
    fn clone(&self) -> Self {
        Self::acquire(&self.entry)
    }
}

impl<B: Backend> Drop for EntryHandle<B> {
    fn drop(&mut self) {
        self.entry.holders.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<B: Backend> Deref for EntryHandle<B> {
    type Target = CacheEntry<B>;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

impl<B: Backend> fmt::Debug for EntryHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.entry, f)
    }
}
