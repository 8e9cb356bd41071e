//! Lock admission, release and cancellation.

use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, instrument, trace, warn};

use super::{
    BlockedState, Blocking, BlockingProtocol, LockDescriptor, LockEntry, LockOwner, LockType,
    OwnerMatcher, ShareReservation, conflicts,
    grant::{GrantNotice, GrantNotifier, GrantOutcome, GrantQueue},
    list::{ListChange, LockList},
};
use crate::{
    backend::{Backend, LockOp, LockSupport},
    cache::{CacheEntry, EntryCache, EntryHandle, HandleKey, Validity},
    error::{BackendError, CacheError, ConflictWitness},
    registry::StateRegistry,
};

/// A lock request as the protocol layer hands it over.
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Requester.
    pub owner: Arc<LockOwner>,
    /// Range and type wanted.
    pub descriptor: LockDescriptor,
    /// What to do on conflict.
    pub blocking: Blocking,
    /// Opaque value echoed in the grant notice.
    pub cookie: Bytes,
    /// Re-establishing a lock held before a server restart.
    pub reclaim: bool,
}

impl LockRequest {
    /// A non-blocking, non-reclaim request with an empty cookie.
    #[must_use]
    pub fn new(owner: Arc<LockOwner>, descriptor: LockDescriptor) -> Self {
        Self {
            owner,
            descriptor,
            blocking: Blocking::NonBlocking,
            cookie: Bytes::new(),
            reclaim: false,
        }
    }

    /// Wait on conflict and get notified through `protocol`.
    #[must_use]
    pub fn blocking(mut self, protocol: BlockingProtocol) -> Self {
        self.blocking = Blocking::Blocking(protocol);
        self
    }

    /// Attach a cookie.
    #[must_use]
    pub fn with_cookie(mut self, cookie: impl Into<Bytes>) -> Self {
        self.cookie = cookie.into();
        self
    }

    /// Mark as a grace-period reclaim.
    #[must_use]
    pub fn reclaim(mut self) -> Self {
        self.reclaim = true;
        self
    }
}

/// Successful outcome of [`LockManager::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is held.
    Granted,
    /// The request was queued behind a conflicting lock.
    Blocked,
    /// An identical request of the same owner is already queued.
    AlreadyBlocked,
}

/// Outcome of [`LockManager::test`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    /// The lock could be granted now.
    Clear,
    /// It would conflict with the witness.
    Conflict(ConflictWitness),
}

/// Outcome of [`LockManager::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    /// A pending request was removed.
    Found,
    /// Nothing matched.
    NotFound,
}

/// Outcome of the unlock family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStatus {
    /// At least one lock or pending request was removed or shortened.
    Released,
    /// The owner held nothing in the range.
    NotHeld,
}

/// Push the list's journal into the holdings ledger. Unlinked entries are dropped here, after
/// they left the list.
fn settle(registry: &StateRegistry, key: &HandleKey, list: &mut LockList) {
    let mut deltas: FxHashMap<Arc<LockOwner>, (usize, usize)> = FxHashMap::default();
    for change in list.take_changes() {
        match change {
            ListChange::Linked(entry) => deltas.entry(Arc::clone(&entry.owner)).or_default().0 += 1,
            ListChange::Unlinked(entry) => {
                deltas.entry(Arc::clone(&entry.owner)).or_default().1 += 1;
            }
        }
    }
    for (owner, (linked, unlinked)) in deltas {
        registry.adjust(&owner, key, linked, unlinked);
    }
}

/// State shared between the manager front-end and the grant worker.
pub(crate) struct LockCore<B: Backend> {
    cache: EntryCache<B>,
    notifier: Arc<dyn GrantNotifier>,
}

impl<B: Backend> LockCore<B> {
    fn registry(&self) -> &StateRegistry {
        self.cache.registry()
    }

    fn matcher(&self) -> &dyn OwnerMatcher {
        self.cache.registry().matcher()
    }

    /// Lock down-call, per the backend's capability.
    async fn push_lock(
        &self,
        entry: &CacheEntry<B>,
        owner: &LockOwner,
        descriptor: LockDescriptor,
    ) -> Result<(), BackendError> {
        let backend = self.cache.backend();
        match backend.lock_support() {
            LockSupport::None => Ok(()),
            LockSupport::NoOwner => {
                backend
                    .lock_op(entry.handle(), None, LockOp::Lock, descriptor)
                    .await
            }
            LockSupport::Owner => {
                backend
                    .lock_op(entry.handle(), Some(owner), LockOp::Lock, descriptor)
                    .await
            }
        }
    }

    /// Unlock down-call. Without owner support, ranges still held by anyone in `remaining` are
    /// skipped.
    async fn push_unlock(
        &self,
        entry: &CacheEntry<B>,
        remaining: &LockList,
        owner: &LockOwner,
        range: LockDescriptor,
    ) -> Result<(), BackendError> {
        let backend = self.cache.backend();
        match backend.lock_support() {
            LockSupport::None => Ok(()),
            LockSupport::Owner => {
                backend
                    .lock_op(entry.handle(), Some(owner), LockOp::Unlock, range)
                    .await
            }
            LockSupport::NoOwner => {
                let mut pieces = vec![range];
                for held in remaining.iter().filter(|e| e.is_granted()) {
                    pieces = pieces
                        .into_iter()
                        .flat_map(|piece| piece.subtract(&held.descriptor))
                        .collect();
                }
                trace!(pieces = pieces.len(), "Unlocking unshared pieces.");
                for piece in pieces {
                    backend
                        .lock_op(entry.handle(), None, LockOp::Unlock, piece)
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Whether a different owner already holds a same-type lock covering `descriptor` that
    /// makes a down-call pointless for a backend without owner support.
    fn shadowed(&self, list: &LockList, owner: &LockOwner, descriptor: &LockDescriptor) -> bool {
        self.cache.backend().lock_support() != LockSupport::Owner
            && list.iter().any(|e| {
                e.is_granted()
                    && e.descriptor.lock_type == descriptor.lock_type
                    && e.descriptor.covers(descriptor)
                    && !self.matcher().same_owner(&e.owner, owner)
            })
    }

    async fn fail_backend<T>(
        &self,
        entry: &CacheEntry<B>,
        err: BackendError,
    ) -> Result<T, CacheError> {
        if matches!(err, BackendError::Stale) {
            self.cache.mark_stale(entry).await;
        } else {
            warn!(key = %entry.key(), %err, "Lock down-call failed.");
        }
        Err(err.into())
    }

    /// Remove `range` from `owner`'s locks on `entry`. Returns the status and whether pending
    /// requests should be re-evaluated.
    async fn release(
        &self,
        entry: &CacheEntry<B>,
        owner: &LockOwner,
        range: LockDescriptor,
    ) -> (Result<UnlockStatus, CacheError>, bool) {
        let mut state = entry.write().await;
        let file = match state.file_mut() {
            Ok(file) => file,
            Err(err) => return (Err(err), false),
        };
        if file.locks.is_empty() {
            return (Ok(UnlockStatus::NotHeld), false);
        }

        let checkpoint = file.locks.checkpoint();
        let cancelled = file
            .locks
            .cancel_blocked_range(self.matcher(), owner, &range)
            .len();
        let touched = file.locks.subtract(self.matcher(), owner, &range);
        if touched > 0
            && let Err(err) = self.push_unlock(entry, &file.locks, owner, range).await
        {
            file.locks.restore(checkpoint);
            drop(state);
            return (self.fail_backend(entry, err).await, false);
        }
        drop(checkpoint);
        settle(self.registry(), entry.key(), &mut file.locks);
        let wake = file.locks.has_blocked() && touched + cancelled > 0;
        drop(state);

        debug!(key = %entry.key(), %range, touched, cancelled, "Unlocked.");
        let status = if touched + cancelled > 0 {
            UnlockStatus::Released
        } else {
            UnlockStatus::NotHeld
        };
        (Ok(status), wake)
    }

    /// Take back what an undelivered grant gave `owner`. Locks the grant retyped get their old
    /// type back; bytes the owner held the same way before are kept.
    async fn revoke(
        &self,
        entry: &CacheEntry<B>,
        owner: &Arc<LockOwner>,
        grant: &GrantedBytes,
    ) -> Result<(), CacheError> {
        let mut state = entry.write().await;
        let file = state.file_mut()?;
        for range in &grant.added {
            file.locks.subtract(self.matcher(), owner, range);
        }
        for &lost in &grant.retyped {
            let mut merged = lost;
            file.locks.merge(self.matcher(), owner, &mut merged);
            file.locks.link(Arc::new(LockEntry {
                id: self.registry().next_lock_id(),
                owner: Arc::clone(owner),
                descriptor: merged,
                blocked: BlockedState::Granted,
                cookie: Bytes::new(),
            }));
        }

        let mut pushed = Ok(());
        for &range in &grant.added {
            pushed = self.push_unlock(entry, &file.locks, owner, range).await;
            if pushed.is_err() {
                break;
            }
        }
        if pushed.is_ok() {
            for &lost in &grant.retyped {
                pushed = self.push_lock(entry, owner, lost).await;
                if pushed.is_err() {
                    break;
                }
            }
        }
        settle(self.registry(), entry.key(), &mut file.locks);
        drop(state);

        trace!(
            key = %entry.key(),
            added = grant.added.len(),
            retyped = grant.retyped.len(),
            "Revoked grant."
        );
        match pushed {
            Ok(()) => Ok(()),
            Err(err) => self.fail_backend(entry, err).await,
        }
    }

    /// Grant whatever pending requests on `entry` no longer conflict, then deliver notices.
    ///
    /// Requests are considered in arrival order; see [`LockList::must_wait`].
    ///
    /// Returns `true` when a delivery failed and a grant was revoked, in which case the caller
    /// should run again.
    pub(crate) async fn regrant(&self, entry: &Arc<CacheEntry<B>>) -> bool {
        if entry.validity() == Validity::Recycled {
            return false;
        }

        let mut notices = Vec::new();
        let mut stale = false;
        {
            let mut state = entry.write().await;
            let Ok(file) = state.file_mut() else {
                return false;
            };
            let waiting: Vec<Arc<LockEntry>> = file
                .locks
                .iter()
                .filter(|e| !e.is_granted())
                .cloned()
                .collect();

            for request in waiting {
                let BlockedState::Blocked(protocol) = request.blocked else {
                    continue;
                };
                if file.locks.must_wait(self.matcher(), &request) {
                    continue;
                }

                let pushed = if self.shadowed(&file.locks, &request.owner, &request.descriptor) {
                    Ok(())
                } else {
                    self.push_lock(entry, &request.owner, request.descriptor)
                        .await
                };
                file.locks.unlink(&request);

                let (outcome, grant) = match pushed {
                    Ok(()) => {
                        let grant = GrantedBytes::compute(
                            &file.locks,
                            self.matcher(),
                            &request.owner,
                            &request.descriptor,
                        );
                        let mut merged = request.descriptor;
                        file.locks.merge(self.matcher(), &request.owner, &mut merged);
                        file.locks.link(Arc::new(request.granted_as(merged)));
                        (GrantOutcome::Granted, Some(grant))
                    }
                    Err(err) => {
                        warn!(key = %entry.key(), %err, "Backend refused blocked lock.");
                        stale |= matches!(err, BackendError::Stale);
                        (GrantOutcome::Denied, None)
                    }
                };
                trace!(
                    key = %entry.key(),
                    descriptor = %request.descriptor,
                    ?outcome,
                    "Re-evaluated blocked lock."
                );
                notices.push((
                    GrantNotice {
                        key: entry.key().clone(),
                        owner: Arc::clone(&request.owner),
                        descriptor: request.descriptor,
                        cookie: request.cookie.clone(),
                        protocol,
                        outcome,
                    },
                    grant,
                ));
            }
            settle(self.registry(), entry.key(), &mut file.locks);
        }
        if stale {
            self.cache.mark_stale(entry).await;
        }

        let mut revoked = false;
        for (notice, grant) in notices {
            match (self.notifier.notify(&notice).await, grant) {
                (Ok(()), _) => debug!(
                    key = %notice.key,
                    descriptor = %notice.descriptor,
                    outcome = ?notice.outcome,
                    "Delivered grant notice."
                ),
                (Err(err), Some(grant)) => {
                    warn!(key = %notice.key, %err, "Grant notice undeliverable, revoking lock.");
                    if let Err(err) = self.revoke(entry, &notice.owner, &grant).await {
                        warn!(key = %notice.key, %err, "Failed to revoke undelivered grant.");
                    }
                    revoked = true;
                }
                (Err(err), None) => {
                    warn!(key = %notice.key, %err, "Denial notice undeliverable.");
                }
            }
        }
        revoked
    }
}

/// What a grant changed for its owner.
#[derive(Debug)]
struct GrantedBytes {
    /// Bytes the owner did not hold with the granted type before.
    added: Vec<LockDescriptor>,
    /// Parts of the owner's other-type locks the grant replaced, with their old type.
    retyped: Vec<LockDescriptor>,
}

impl GrantedBytes {
    /// Computed against `list` before `request` is merged into it.
    fn compute(
        list: &LockList,
        matcher: &dyn OwnerMatcher,
        owner: &LockOwner,
        request: &LockDescriptor,
    ) -> Self {
        let mut added = vec![*request];
        let mut retyped = Vec::new();
        for held in list.granted_by(matcher, owner) {
            if held.descriptor.lock_type == request.lock_type {
                added = added
                    .into_iter()
                    .flat_map(|piece| piece.subtract(&held.descriptor))
                    .collect();
            } else if let Some(lost) = held.descriptor.intersect(request) {
                retyped.push(lost);
            }
        }
        Self { added, retyped }
    }
}

/// Byte-range lock manager over the regular files of an [`EntryCache`].
///
/// Every operation takes the file's lifecycle lock for writing for its whole duration, so the
/// lock list of one file is only ever seen in a consistent state. Pending requests are
/// re-evaluated on a background worker; see [`GrantNotifier`].
pub struct LockManager<B: Backend> {
    core: Arc<LockCore<B>>,
    grants: GrantQueue<B>,
}

impl<B: Backend> std::fmt::Debug for LockManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("cache", &self.core.cache)
            .field("grants_idle", &self.grants.is_idle())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> LockManager<B> {
    /// A manager for the files of `cache`, sharing its registry. Starts the grant worker, so it
    /// must be called inside a tokio runtime.
    pub fn new(cache: &EntryCache<B>, notifier: Arc<dyn GrantNotifier>) -> Self {
        let core = Arc::new(LockCore {
            cache: cache.clone(),
            notifier,
        });
        let grants = GrantQueue::spawn(Arc::clone(&core), cache.config().grant_channel_size);
        Self { core, grants }
    }

    /// Whether re-evaluations are queued or running.
    #[must_use]
    pub fn have_pending_grants(&self) -> bool {
        !self.grants.is_idle()
    }

    fn check_target(entry: &CacheEntry<B>, descriptor: &LockDescriptor) -> Result<(), CacheError> {
        if !entry.entry_type().is_file() {
            return Err(CacheError::BadType);
        }
        descriptor.check()
    }

    /// Report the first held lock that would conflict with `owner` locking `descriptor`.
    ///
    /// Pending requests are ignored. With an owner-aware backend, a clear cache result is
    /// double-checked with a test down-call.
    pub async fn test(
        &self,
        entry: &EntryHandle<B>,
        owner: &LockOwner,
        descriptor: LockDescriptor,
    ) -> Result<TestOutcome, CacheError> {
        Self::check_target(entry, &descriptor)?;
        let state = entry.write().await;
        if let Some(held) =
            state
                .file()?
                .locks
                .first_conflict(self.core.matcher(), owner, &descriptor)
        {
            return Ok(TestOutcome::Conflict(ConflictWitness {
                holder: Some(Arc::clone(&held.owner)),
                descriptor: held.descriptor,
            }));
        }

        let backend = self.core.cache.backend();
        if backend.lock_support() == LockSupport::Owner {
            match backend
                .lock_op(entry.handle(), Some(owner), LockOp::Test, descriptor)
                .await
            {
                Ok(()) => {}
                Err(BackendError::LockConflict(held)) => {
                    return Ok(TestOutcome::Conflict(ConflictWitness {
                        holder: None,
                        descriptor: held,
                    }));
                }
                Err(err) => {
                    drop(state);
                    return self.core.fail_backend(entry, err).await;
                }
            }
        }
        Ok(TestOutcome::Clear)
    }

    /// Acquire a lock, or queue it when blocking was requested.
    ///
    /// Never waits for a conflicting lock. A non-blocking request that conflicts fails with
    /// [`CacheError::Conflict`]. Pending requests of other owners count as conflicts, so a
    /// steady stream of readers cannot starve a queued writer. An owner converting a range it
    /// already holds, such as a read-to-write upgrade, only waits for held locks.
    #[instrument(
        name = "LockManager::lock",
        skip(self, entry, request),
        fields(key = %entry.key(), descriptor = %request.descriptor)
    )]
    pub async fn lock(
        &self,
        entry: &EntryHandle<B>,
        request: LockRequest,
    ) -> Result<LockStatus, CacheError> {
        Self::check_target(entry, &request.descriptor)?;
        let registry = self.core.registry();
        match (registry.in_grace(), request.reclaim) {
            (true, false) => return Err(CacheError::InGrace),
            (false, true) => return Err(CacheError::NoGrace),
            _ => {}
        }
        let matcher = self.core.matcher();
        let owner = &request.owner;
        let descriptor = request.descriptor;

        let mut state = entry.write().await;
        let file = state.file_mut()?;

        if file.locks.find_blocked(matcher, owner, &descriptor).is_some() {
            trace!("Identical request already queued.");
            return Ok(LockStatus::AlreadyBlocked);
        }

        let mut witness = None;
        let mut overlap = false;
        if !request.reclaim {
            // An owner changing a range it already holds only waits for held locks.
            let converting = file
                .locks
                .granted_by(matcher, owner)
                .any(|e| e.descriptor.overlaps(&descriptor));
            for existing in file.locks.iter() {
                if existing.is_granted()
                    && existing.descriptor.lock_type == descriptor.lock_type
                    && existing.descriptor.covers(&descriptor)
                {
                    if matcher.same_owner(&existing.owner, owner) {
                        trace!("Already held by the same owner.");
                        return Ok(LockStatus::Granted);
                    }
                    if self.core.cache.backend().lock_support() != LockSupport::Owner {
                        overlap = true;
                    }
                }
                if witness.is_none()
                    && (existing.is_granted() || !converting)
                    && conflicts(
                        matcher,
                        &existing.owner,
                        &existing.descriptor,
                        owner,
                        &descriptor,
                    )
                {
                    witness = Some(ConflictWitness {
                        holder: Some(Arc::clone(&existing.owner)),
                        descriptor: existing.descriptor,
                    });
                }
            }
        }

        let blocked = match (witness, request.blocking) {
            (Some(witness), Blocking::NonBlocking) => {
                debug!(holder = ?witness.holder, held = %witness.descriptor, "Lock conflict.");
                return Err(CacheError::Conflict(witness));
            }
            (Some(_), Blocking::Blocking(protocol)) => BlockedState::Blocked(protocol),
            (None, _) => BlockedState::Granted,
        };

        file.locks.reserve(1)?;
        if blocked == BlockedState::Granted && !overlap {
            if let Err(err) = self.core.push_lock(entry, owner, descriptor).await {
                drop(state);
                return self.core.fail_backend(entry, err).await;
            }
        }

        let new_entry = LockEntry {
            id: registry.next_lock_id(),
            owner: Arc::clone(owner),
            descriptor,
            blocked,
            cookie: request.cookie,
        };
        let mut wake = false;
        let status = if blocked == BlockedState::Granted {
            let mut merged = descriptor;
            let absorbed = file.locks.merge(matcher, owner, &mut merged);
            wake = absorbed > 0 && file.locks.has_blocked();
            file.locks.link(Arc::new(LockEntry {
                descriptor: merged,
                ..new_entry
            }));
            LockStatus::Granted
        } else {
            file.locks.link(Arc::new(new_entry));
            LockStatus::Blocked
        };
        settle(registry, entry.key(), &mut file.locks);
        drop(state);

        debug!(?status, overlap, "Lock request admitted.");
        if wake {
            self.grants.schedule(entry.entry());
        }
        Ok(status)
    }

    /// Release `range` from `owner`'s locks, splitting locks that extend past it.
    ///
    /// The owner's pending requests overlapping the range are cancelled first.
    pub async fn unlock(
        &self,
        entry: &EntryHandle<B>,
        owner: &LockOwner,
        range: LockDescriptor,
    ) -> Result<UnlockStatus, CacheError> {
        Self::check_target(entry, &range)?;
        let (result, wake) = self.core.release(entry, owner, range).await;
        if wake {
            self.grants.schedule(entry.entry());
        }
        result
    }

    /// Withdraw a pending request. Idempotent.
    ///
    /// When `cookie` is given it must match the request's cookie as well.
    pub async fn cancel(
        &self,
        entry: &EntryHandle<B>,
        owner: &LockOwner,
        descriptor: LockDescriptor,
        cookie: Option<&[u8]>,
    ) -> Result<CancelStatus, CacheError> {
        Self::check_target(entry, &descriptor)?;
        let matcher = self.core.matcher();
        let mut state = entry.write().await;
        let file = state.file_mut()?;

        let Some(target) = file
            .locks
            .iter()
            .find(|e| {
                !e.is_granted()
                    && e.descriptor == descriptor
                    && matcher.same_owner(&e.owner, owner)
                    && cookie.is_none_or(|c| e.cookie[..] == *c)
            })
            .cloned()
        else {
            return Ok(CancelStatus::NotFound);
        };

        file.locks.unlink(&target);
        settle(self.core.registry(), entry.key(), &mut file.locks);
        let wake = file.locks.has_blocked();
        drop(state);
        drop(target);

        debug!(key = %entry.key(), %descriptor, "Cancelled pending lock.");
        if wake {
            self.grants.schedule(entry.entry());
        }
        Ok(CancelStatus::Found)
    }

    /// Drop every lock and pending request `owner` has on `entry`.
    pub async fn unlock_owner(
        &self,
        entry: &EntryHandle<B>,
        owner: &LockOwner,
    ) -> Result<UnlockStatus, CacheError> {
        if !entry.entry_type().is_file() {
            return Err(CacheError::BadType);
        }
        let mut state = entry.write().await;
        let file = state.file_mut()?;
        let checkpoint = file.locks.checkpoint();
        let removed = file.locks.remove_owner(self.core.matcher(), owner);
        if removed.is_empty() {
            return Ok(UnlockStatus::NotHeld);
        }

        if removed.iter().any(|e| e.is_granted())
            && let Err(err) = self
                .core
                .push_unlock(
                    entry,
                    &file.locks,
                    owner,
                    LockDescriptor::whole_file(LockType::Write),
                )
                .await
        {
            drop(removed);
            file.locks.restore(checkpoint);
            drop(state);
            return self.core.fail_backend(entry, err).await;
        }
        drop(checkpoint);
        drop(removed);
        settle(self.core.registry(), entry.key(), &mut file.locks);
        let wake = file.locks.has_blocked();
        drop(state);

        if wake {
            self.grants.schedule(entry.entry());
        }
        Ok(UnlockStatus::Released)
    }

    /// Drop everything `owner` holds on any cached file. Returns how many files were affected.
    pub async fn release_owner(&self, owner: &LockOwner) -> Result<usize, CacheError> {
        let mut released = 0;
        for key in self.core.registry().files_of(owner) {
            let Some(entry) = self.core.cache.get(&key).await else {
                continue;
            };
            if self.unlock_owner(&entry, owner).await? == UnlockStatus::Released {
                released += 1;
            }
        }
        debug!(released, "Released owner state.");
        Ok(released)
    }

    /// Record a share reservation. Fails with [`CacheError::ShareDenied`] when another owner's
    /// reservation clashes with it.
    pub async fn add_share(
        &self,
        entry: &EntryHandle<B>,
        reservation: ShareReservation,
    ) -> Result<(), CacheError> {
        let mut state = entry.write().await;
        let file = state.file_mut()?;
        if let Some(clash) = file.shares.conflict(
            self.core.matcher(),
            &reservation.owner,
            reservation.access,
            reservation.deny,
        ) {
            debug!(key = %entry.key(), holder = ?clash.owner, "Share reservation denied.");
            return Err(CacheError::ShareDenied);
        }
        file.shares.add(reservation);
        Ok(())
    }

    /// Drop `owner`'s share reservations. Returns how many were removed.
    pub async fn remove_share(
        &self,
        entry: &EntryHandle<B>,
        owner: &LockOwner,
    ) -> Result<usize, CacheError> {
        let mut state = entry.write().await;
        Ok(state.file_mut()?.shares.remove(self.core.matcher(), owner))
    }
}
