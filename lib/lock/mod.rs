//! Byte-range lock model.
//!
//! Locks are POSIX/NLM advisory locks: a type, an offset and a length, where a length of zero
//! extends the range to the end of the file. Two locks conflict when their ranges overlap, at
//! least one is a write lock and their owners differ.

use std::{fmt, sync::Arc};

use bytes::Bytes;

mod grant;
mod list;
mod manager;
mod share;

pub use grant::{GrantNotice, GrantNotifier, GrantOutcome, NotifyError, SilentNotifier};
pub use list::LockList;
pub use manager::{CancelStatus, LockManager, LockRequest, LockStatus, TestOutcome, UnlockStatus};
pub use share::{ShareAccess, ShareDeny, ShareReservation, ShareTable};

/// Shared or exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// Shared lock.
    Read,
    /// Exclusive lock.
    Write,
}

/// A typed byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockDescriptor {
    /// Read or write.
    pub lock_type: LockType,
    /// First byte covered.
    pub offset: u64,
    /// Number of bytes covered. Zero means "through end of file".
    pub length: u64,
}

impl fmt::Display for LockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.lock_type {
            LockType::Read => "R",
            LockType::Write => "W",
        };
        if self.length == 0 {
            write!(f, "{kind}[{}, EOF]", self.offset)
        } else {
            write!(f, "{kind}[{}, {}]", self.offset, self.end())
        }
    }
}

impl LockDescriptor {
    /// A range of `length` bytes starting at `offset`.
    #[must_use]
    pub fn new(lock_type: LockType, offset: u64, length: u64) -> Self {
        Self {
            lock_type,
            offset,
            length,
        }
    }

    /// Shorthand for a read lock.
    #[must_use]
    pub fn read(offset: u64, length: u64) -> Self {
        Self::new(LockType::Read, offset, length)
    }

    /// Shorthand for a write lock.
    #[must_use]
    pub fn write(offset: u64, length: u64) -> Self {
        Self::new(LockType::Write, offset, length)
    }

    /// The whole file.
    #[must_use]
    pub fn whole_file(lock_type: LockType) -> Self {
        Self::new(lock_type, 0, 0)
    }

    /// Build from inclusive bounds. An `end` of `u64::MAX` yields a to-EOF range.
    #[must_use]
    pub fn from_bounds(lock_type: LockType, start: u64, end: u64) -> Self {
        let length = if end == u64::MAX { 0 } else { end - start + 1 };
        Self::new(lock_type, start, length)
    }

    /// Last byte covered, inclusive.
    ///
    /// Ranges running past `u64::MAX` are clamped to it.
    #[must_use]
    pub fn end(&self) -> u64 {
        if self.length == 0 {
            u64::MAX
        } else {
            self.offset.saturating_add(self.length - 1)
        }
    }

    /// Reject ranges whose last byte is not addressable.
    pub(crate) fn check(&self) -> Result<(), crate::CacheError> {
        if self.length != 0 && self.offset.checked_add(self.length - 1).is_none() {
            return Err(crate::CacheError::InvalidArgument(
                "lock range overflows the file offset space",
            ));
        }
        Ok(())
    }

    /// Whether the two ranges share at least one byte.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.offset <= other.end() && other.offset <= self.end()
    }

    /// Whether the two ranges overlap or are directly adjacent.
    #[must_use]
    pub fn touches(&self, other: &Self) -> bool {
        self.end().saturating_add(1) >= other.offset && other.end().saturating_add(1) >= self.offset
    }

    /// Whether `self` covers every byte of `other`.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        self.offset <= other.offset && self.end() >= other.end()
    }

    /// The bytes both ranges cover, keeping `self`'s type.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        self.overlaps(other).then(|| {
            Self::from_bounds(
                self.lock_type,
                self.offset.max(other.offset),
                self.end().min(other.end()),
            )
        })
    }

    /// Smallest range covering both, keeping `self`'s type.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self::from_bounds(
            self.lock_type,
            self.offset.min(other.offset),
            self.end().max(other.end()),
        )
    }

    /// What remains of `self` once `cut` is removed: zero, one or two ranges, left part first.
    #[must_use]
    pub fn subtract(&self, cut: &Self) -> Vec<Self> {
        if !self.overlaps(cut) {
            return vec![*self];
        }
        let mut rest = Vec::with_capacity(2);
        if cut.offset > self.offset {
            rest.push(Self::from_bounds(self.lock_type, self.offset, cut.offset - 1));
        }
        if cut.end() < self.end() {
            rest.push(Self::from_bounds(self.lock_type, cut.end() + 1, self.end()));
        }
        rest
    }

    /// Whether at least one side is a write lock.
    #[must_use]
    pub fn excludes(&self, other: &Self) -> bool {
        self.lock_type == LockType::Write || other.lock_type == LockType::Write
    }
}

/// Which protocol family an owner belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    /// NLM (NFSv3 side-band locking).
    Nlm,
    /// NFSv4 lock owner.
    Nfs4,
    /// A process local to the server.
    Local,
}

/// Identity of a lock holder, opaque to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner {
    /// Protocol family.
    pub kind: OwnerKind,
    /// Client identity (caller name or client id).
    pub client: Bytes,
    /// Owner handle bytes.
    pub id: Bytes,
    /// Client process id, when the protocol has one.
    pub svid: u32,
}

impl LockOwner {
    /// An owner with no process id.
    #[must_use]
    pub fn new(kind: OwnerKind, client: impl Into<Bytes>, id: impl Into<Bytes>) -> Self {
        Self {
            kind,
            client: client.into(),
            id: id.into(),
            svid: 0,
        }
    }

    /// Set the client process id.
    #[must_use]
    pub fn with_svid(mut self, svid: u32) -> Self {
        self.svid = svid;
        self
    }
}

/// Owner equality supplied by the protocol layer.
///
/// Implementations must be symmetric. Closures of the right shape implement it.
pub trait OwnerMatcher: Send + Sync {
    /// Whether `a` and `b` denote the same lock holder.
    fn same_owner(&self, a: &LockOwner, b: &LockOwner) -> bool;
}

impl<F> OwnerMatcher for F
where
    F: Fn(&LockOwner, &LockOwner) -> bool + Send + Sync,
{
    fn same_owner(&self, a: &LockOwner, b: &LockOwner) -> bool {
        self(a, b)
    }
}

/// Owners are equal when every field is equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactOwnerMatch;

impl OwnerMatcher for ExactOwnerMatch {
    fn same_owner(&self, a: &LockOwner, b: &LockOwner) -> bool {
        a == b
    }
}

/// Protocol a blocked request is waiting through; selects how the grant is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockingProtocol {
    /// NLM granted callback.
    Nlm,
    /// NFSv4 client polling.
    Nfs4,
    /// In-process waiter.
    Local,
}

/// What the requester wants to happen on conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking {
    /// Fail immediately.
    NonBlocking,
    /// Queue the request and notify through the given protocol.
    Blocking(BlockingProtocol),
}

/// Whether a linked lock entry is held or waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedState {
    /// The lock is held.
    Granted,
    /// The request waits for conflicting locks to go away.
    Blocked(BlockingProtocol),
}

/// Identifier of a lock entry, unique per registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(pub u64);

/// One lock or pending lock request on a file.
///
/// Immutable once linked. Changes to a linked lock replace the entry.
#[derive(Debug)]
pub struct LockEntry {
    /// Registry-assigned identifier. Fragments of a split lock keep the original id.
    pub id: LockId,
    /// Holder.
    pub owner: Arc<LockOwner>,
    /// Range and type.
    pub descriptor: LockDescriptor,
    /// Held or waiting.
    pub blocked: BlockedState,
    /// Protocol cookie echoed back in grant notifications.
    pub cookie: Bytes,
}

impl LockEntry {
    /// Whether this entry is a held lock.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        self.blocked == BlockedState::Granted
    }

    /// A copy of this entry with a different range.
    #[must_use]
    pub(crate) fn with_descriptor(&self, descriptor: LockDescriptor) -> Self {
        Self {
            id: self.id,
            owner: Arc::clone(&self.owner),
            descriptor,
            blocked: self.blocked,
            cookie: self.cookie.clone(),
        }
    }

    /// A granted copy of this entry with a different range.
    #[must_use]
    pub(crate) fn granted_as(&self, descriptor: LockDescriptor) -> Self {
        Self {
            blocked: BlockedState::Granted,
            ..self.with_descriptor(descriptor)
        }
    }
}

/// The core conflict rule.
#[must_use]
pub fn conflicts(
    matcher: &dyn OwnerMatcher,
    a_owner: &LockOwner,
    a: &LockDescriptor,
    b_owner: &LockOwner,
    b: &LockDescriptor,
) -> bool {
    a.overlaps(b) && a.excludes(b) && !matcher.same_owner(a_owner, b_owner)
}
