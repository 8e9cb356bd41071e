//! The per-file lock list.

use std::sync::Arc;

use tracing::trace;

use super::{LockDescriptor, LockEntry, LockOwner, OwnerMatcher, conflicts};

/// A change made to a [`LockList`] since the last [`LockList::take_changes`].
#[derive(Debug, Clone)]
pub(crate) enum ListChange {
    Linked(Arc<LockEntry>),
    Unlinked(Arc<LockEntry>),
}

/// A saved [`LockList`] state.
#[derive(Debug)]
pub(crate) struct Checkpoint {
    entries: Vec<Arc<LockEntry>>,
    journaled: usize,
}

/// Ordered locks and pending lock requests of one regular file.
///
/// Entries are appended, so order reflects arrival. Every link and unlink is journaled; the lock
/// manager drains the journal into the registry's holdings ledger before releasing the entry
/// lock.
#[derive(Debug, Default)]
pub struct LockList {
    entries: Vec<Arc<LockEntry>>,
    journal: Vec<ListChange>,
}

impl LockList {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Linked entries in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<LockEntry>> {
        self.entries.iter()
    }

    /// Number of linked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is linked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any pending request is linked.
    #[must_use]
    pub fn has_blocked(&self) -> bool {
        self.entries.iter().any(|e| !e.is_granted())
    }

    /// Granted locks held by `owner`.
    pub fn granted_by<'a>(
        &'a self,
        matcher: &'a dyn OwnerMatcher,
        owner: &'a LockOwner,
    ) -> impl Iterator<Item = &'a Arc<LockEntry>> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.is_granted() && matcher.same_owner(&e.owner, owner))
    }

    /// Make room for `additional` more entries, or fail without touching the list.
    pub(crate) fn reserve(&mut self, additional: usize) -> Result<(), crate::CacheError> {
        self.entries
            .try_reserve(additional)
            .and_then(|()| self.journal.try_reserve(additional))
            .map_err(|_| crate::CacheError::AllocationFailure)
    }

    pub(crate) fn link(&mut self, entry: Arc<LockEntry>) {
        self.journal.push(ListChange::Linked(Arc::clone(&entry)));
        self.entries.push(entry);
    }

    fn unlink_at(&mut self, idx: usize) -> Arc<LockEntry> {
        let entry = self.entries.remove(idx);
        self.journal.push(ListChange::Unlinked(Arc::clone(&entry)));
        entry
    }

    /// Unlink the entry identical (pointer-equal) to `entry`, if still linked.
    pub(crate) fn unlink(&mut self, entry: &Arc<LockEntry>) -> Option<Arc<LockEntry>> {
        let idx = self.entries.iter().position(|e| Arc::ptr_eq(e, entry))?;
        Some(self.unlink_at(idx))
    }

    /// Current contents, for [`LockList::restore`].
    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            entries: self.entries.clone(),
            journaled: self.journal.len(),
        }
    }

    /// Put back the entries of `checkpoint` and forget every change made since it was taken.
    pub(crate) fn restore(&mut self, checkpoint: Checkpoint) {
        trace!(
            entries = checkpoint.entries.len(),
            undone = self.journal.len().saturating_sub(checkpoint.journaled),
            "Restoring lock list."
        );
        self.entries = checkpoint.entries;
        self.journal.truncate(checkpoint.journaled);
    }

    /// Drain the journal.
    pub(crate) fn take_changes(&mut self) -> Vec<ListChange> {
        std::mem::take(&mut self.journal)
    }

    /// First held lock that conflicts with `owner` locking `descriptor`.
    #[must_use]
    pub fn first_conflict(
        &self,
        matcher: &dyn OwnerMatcher,
        owner: &LockOwner,
        descriptor: &LockDescriptor,
    ) -> Option<&Arc<LockEntry>> {
        self.entries.iter().find(|e| {
            e.is_granted() && conflicts(matcher, &e.owner, &e.descriptor, owner, descriptor)
        })
    }

    /// Whether the linked pending `request` has to keep waiting.
    ///
    /// Held locks always count. Pending requests queued ahead of it count too, unless the
    /// requester already holds part of the range.
    #[must_use]
    pub fn must_wait(&self, matcher: &dyn OwnerMatcher, request: &Arc<LockEntry>) -> bool {
        let converting = self
            .granted_by(matcher, &request.owner)
            .any(|e| e.descriptor.overlaps(&request.descriptor));
        let mut ahead = true;
        self.entries.iter().any(|e| {
            if Arc::ptr_eq(e, request) {
                ahead = false;
                return false;
            }
            (e.is_granted() || (ahead && !converting))
                && conflicts(
                    matcher,
                    &e.owner,
                    &e.descriptor,
                    &request.owner,
                    &request.descriptor,
                )
        })
    }

    /// Pending request of `owner` with exactly `descriptor`.
    #[must_use]
    pub fn find_blocked(
        &self,
        matcher: &dyn OwnerMatcher,
        owner: &LockOwner,
        descriptor: &LockDescriptor,
    ) -> Option<&Arc<LockEntry>> {
        self.entries.iter().find(|e| {
            !e.is_granted() && e.descriptor == *descriptor && matcher.same_owner(&e.owner, owner)
        })
    }

    /// Fold `owner`'s granted locks that touch `descriptor` into it.
    ///
    /// Same-type locks are unioned into `descriptor` and unlinked. A different-type lock covered
    /// by the request is unlinked; one partially overlapped keeps what lies outside the request.
    /// Locks of another type that merely touch are left alone. Single pass: locks that only
    /// become adjacent through earlier unions are not revisited.
    ///
    /// Returns the number of entries unlinked.
    pub(crate) fn merge(
        &mut self,
        matcher: &dyn OwnerMatcher,
        owner: &LockOwner,
        descriptor: &mut LockDescriptor,
    ) -> usize {
        let mut absorbed = 0;
        let mut remainders = Vec::new();
        let mut idx = 0;
        while idx < self.entries.len() {
            let check = &self.entries[idx];
            if !check.is_granted()
                || !matcher.same_owner(&check.owner, owner)
                || !check.descriptor.touches(descriptor)
            {
                idx += 1;
                continue;
            }
            if check.descriptor.lock_type != descriptor.lock_type {
                if !check.descriptor.overlaps(descriptor) {
                    idx += 1;
                    continue;
                }
                let old = self.unlink_at(idx);
                for rest in old.descriptor.subtract(descriptor) {
                    remainders.push(Arc::new(old.with_descriptor(rest)));
                }
                trace!(from = %old.descriptor, to = %descriptor, "Retyping lock range.");
            } else {
                let old = self.unlink_at(idx);
                *descriptor = descriptor.union(&old.descriptor);
                trace!(merged = %old.descriptor, into = %descriptor, "Merging adjacent lock.");
            }
            absorbed += 1;
        }
        for rest in remainders {
            self.link(rest);
        }
        absorbed
    }

    /// Remove `range` from `owner`'s granted locks, splitting where needed.
    ///
    /// Returns how many entries were touched.
    pub(crate) fn subtract(
        &mut self,
        matcher: &dyn OwnerMatcher,
        owner: &LockOwner,
        range: &LockDescriptor,
    ) -> usize {
        let mut touched = 0;
        let mut remainders = Vec::new();
        let mut idx = 0;
        while idx < self.entries.len() {
            let check = &self.entries[idx];
            if !check.is_granted()
                || !matcher.same_owner(&check.owner, owner)
                || !check.descriptor.overlaps(range)
            {
                idx += 1;
                continue;
            }
            let old = self.unlink_at(idx);
            let rest = old.descriptor.subtract(range);
            trace!(lock = %old.descriptor, cut = %range, pieces = rest.len(), "Unlocking range.");
            remainders.extend(rest.into_iter().map(|d| Arc::new(old.with_descriptor(d))));
            touched += 1;
        }
        for rest in remainders {
            self.link(rest);
        }
        touched
    }

    /// Unlink `owner`'s pending requests overlapping `range`.
    pub(crate) fn cancel_blocked_range(
        &mut self,
        matcher: &dyn OwnerMatcher,
        owner: &LockOwner,
        range: &LockDescriptor,
    ) -> Vec<Arc<LockEntry>> {
        self.unlink_where(|e| {
            !e.is_granted() && e.descriptor.overlaps(range) && matcher.same_owner(&e.owner, owner)
        })
    }

    /// Unlink every entry, granted or pending, of `owner`.
    pub(crate) fn remove_owner(
        &mut self,
        matcher: &dyn OwnerMatcher,
        owner: &LockOwner,
    ) -> Vec<Arc<LockEntry>> {
        self.unlink_where(|e| matcher.same_owner(&e.owner, owner))
    }

    fn unlink_where(&mut self, pred: impl Fn(&LockEntry) -> bool) -> Vec<Arc<LockEntry>> {
        let mut removed = Vec::new();
        let mut idx = 0;
        while idx < self.entries.len() {
            if pred(&self.entries[idx]) {
                removed.push(self.unlink_at(idx));
            } else {
                idx += 1;
            }
        }
        removed
    }
}
