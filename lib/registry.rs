//! Server-wide lock state shared by the cache and the lock manager.
//!
//! One [`StateRegistry`] is built by the host and handed to both the
//! [`EntryCache`](crate::cache::EntryCache) and the [`LockManager`](crate::lock::LockManager).
//! It answers three questions the per-file lock lists cannot: which files does an owner hold
//! locks on, does a file hold any lock state at all, and is the server in its grace period.

use std::{
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use scc::hash_map::Entry;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    cache::HandleKey,
    lock::{ExactOwnerMatch, LockId, LockOwner, OwnerMatcher},
    ward::{OnZero, Ward},
};

/// One owner holding lock entries on one file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Holding {
    owner: Arc<LockOwner>,
    key: HandleKey,
}

/// Owner-to-files and file-to-holders indexes, maintained from ledger transitions.
#[derive(Debug, Default)]
struct HoldingIndex {
    by_owner: scc::HashMap<Arc<LockOwner>, FxHashSet<HandleKey>>,
    by_key: scc::HashMap<HandleKey, usize>,
}

impl HoldingIndex {
    fn record(&self, holding: &Holding) {
        self.by_owner
            .entry_sync(Arc::clone(&holding.owner))
            .or_default()
            .get_mut()
            .insert(holding.key.clone());
        *self.by_key.entry_sync(holding.key.clone()).or_insert(0).get_mut() += 1;
    }
}

/// Drops index rows once an owner's last lock entry on a file goes away.
struct ForgetHolding;

impl OnZero<Arc<HoldingIndex>, Holding> for ForgetHolding {
    fn released(index: &Arc<HoldingIndex>, holding: &Holding) {
        if let Entry::Occupied(mut keys) = index.by_owner.entry_sync(Arc::clone(&holding.owner)) {
            keys.get_mut().remove(&holding.key);
            if keys.get().is_empty() {
                let _ = keys.remove_entry();
            }
        }
        if let Entry::Occupied(mut holders) = index.by_key.entry_sync(holding.key.clone()) {
            *holders.get_mut() = holders.get().saturating_sub(1);
            if *holders.get() == 0 {
                let _ = holders.remove_entry();
            }
        }
    }
}

/// Grace period bookkeeping.
#[derive(Debug, Default)]
struct Grace {
    ends_at: Option<Instant>,
}

/// Server-wide lock state.
pub struct StateRegistry {
    matcher: Box<dyn OwnerMatcher>,
    ledger: Mutex<Ward<Arc<HoldingIndex>, Holding, ForgetHolding>>,
    index: Arc<HoldingIndex>,
    grace: RwLock<Grace>,
    next_lock_id: AtomicU64,
}

impl std::fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRegistry")
            .field("holdings", &self.ledger.lock().len())
            .field("in_grace", &self.in_grace())
            .finish_non_exhaustive()
    }
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new(ExactOwnerMatch)
    }
}

impl StateRegistry {
    /// A registry comparing owners with `matcher`.
    pub fn new(matcher: impl OwnerMatcher + 'static) -> Self {
        let index = Arc::new(HoldingIndex::default());
        Self {
            matcher: Box::new(matcher),
            ledger: Mutex::new(Ward::new(Arc::clone(&index))),
            index,
            grace: RwLock::new(Grace::default()),
            next_lock_id: AtomicU64::new(1),
        }
    }

    /// Owner equality in force for this server.
    #[must_use]
    pub fn matcher(&self) -> &dyn OwnerMatcher {
        self.matcher.as_ref()
    }

    pub(crate) fn next_lock_id(&self) -> LockId {
        LockId(self.next_lock_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Account `linked` new and `unlinked` removed lock entries of `owner` on `key`.
    pub(crate) fn adjust(
        &self,
        owner: &Arc<LockOwner>,
        key: &HandleKey,
        linked: usize,
        unlinked: usize,
    ) {
        if linked == unlinked {
            return;
        }
        let holding = Holding {
            owner: Arc::clone(owner),
            key: key.clone(),
        };
        let mut ledger = self.ledger.lock();
        if linked > unlinked {
            let before = ledger.count(&holding);
            let after = ledger.add(holding.clone(), linked - unlinked);
            if before == 0 && after > 0 {
                ledger.ctx().record(&holding);
            }
        } else {
            let _ = ledger.sub(&holding, unlinked - linked);
        }
    }

    /// Files `owner` holds lock entries on.
    #[must_use]
    pub fn files_of(&self, owner: &LockOwner) -> Vec<HandleKey> {
        self.index
            .by_owner
            .read_sync(owner, |_, keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any owner holds lock entries on `key`.
    #[must_use]
    pub fn has_holdings(&self, key: &HandleKey) -> bool {
        self.index.by_key.read_sync(key, |_, _| ()).is_some()
    }

    /// Number of distinct owners holding lock entries on `key`.
    #[must_use]
    pub fn holders_of(&self, key: &HandleKey) -> usize {
        self.index.by_key.read_sync(key, |_, n| *n).unwrap_or(0)
    }

    /// Enter the grace period for `duration`.
    pub fn start_grace(&self, duration: Duration) {
        let ends_at = Instant::now() + duration;
        self.grace
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .ends_at = Some(ends_at);
        info!(?duration, "Grace period started.");
    }

    /// Leave the grace period now.
    pub fn end_grace(&self) {
        let mut grace = self.grace.write().unwrap_or_else(PoisonError::into_inner);
        if grace.ends_at.take().is_some() {
            debug!("Grace period ended.");
        }
    }

    /// Whether only reclaims are accepted.
    #[must_use]
    pub fn in_grace(&self) -> bool {
        self.grace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ends_at
            .is_some_and(|end| Instant::now() < end)
    }
}
