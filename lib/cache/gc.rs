//! Reclaiming entries.
//!
//! Two paths lead here. A collector pass first sweeps entries that are stale or invalid and no
//! longer held; then, above the high water mark, it asks the LRU worker to cull the
//! least-recently-validated entries down to the low water mark. Both end in
//! [`EntryCache::reclaim`], which re-checks everything under the entry's write lock before
//! removing it.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    entry::{CacheEntry, Payload, Validity},
    eviction::lru::Deleter,
    key::{EntryId, HandleKey},
    table::{CacheInner, EntryCache, LruStamp},
};
use crate::backend::Backend;

/// Why an entry is up for reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    /// Culled from the LRU tail; subject to the expiration policy.
    Lru,
    /// Stale or invalid; reclaimed as soon as nobody holds it.
    Unusable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reclaim {
    Done,
    /// Still cached but not eligible right now.
    Kept,
    /// Already gone from the cache.
    Gone,
}

impl<B: Backend> EntryCache<B> {
    async fn reclaim(&self, id: EntryId, cause: Cause) -> Reclaim {
        let Some(entry) = self
            .inner
            .by_id
            .read_async(&id, |_, entry| Arc::clone(entry))
            .await
        else {
            return Reclaim::Gone;
        };
        if entry.holders() > 0 || self.inner.registry.has_holdings(entry.key()) {
            return Reclaim::Kept;
        }

        let mut state = entry.write().await;
        if state.holds_state() {
            return Reclaim::Kept;
        }
        if cause == Cause::Lru
            && let Some(expiration) = self
                .inner
                .config
                .gc
                .expiration(entry.entry_type().is_dir())
            && state.times.last_use().elapsed() < expiration
        {
            return Reclaim::Kept;
        }

        // Handles are only created under the map's bucket lock, so checking the holder count
        // inside `remove_if` cannot race with a new holder.
        let removed = self
            .inner
            .by_key
            .remove_if_async(entry.key(), |cached| {
                Arc::ptr_eq(cached, &entry) && cached.holders() == 0
            })
            .await
            .is_some();
        if !removed {
            return Reclaim::Kept;
        }
        let _ = self.inner.by_id.remove_async(&id).await;
        entry.set_validity(Validity::Recycled);

        let links = std::mem::take(&mut state.parent_links);
        let (descriptor, children) = match &mut state.payload {
            Payload::File(file) => (file.descriptor.take(), Vec::new()),
            Payload::Directory(dir) => (
                None,
                dir.iter()
                    .map(|dirent| dirent.child.clone())
                    .collect::<Vec<HandleKey>>(),
            ),
            Payload::Other => (None, Vec::new()),
        };
        drop(state);

        let unlinked = self.unlink_from_parents(entry.key(), links).await;
        for child in &children {
            self.forget_parent(child, entry.key()).await;
        }
        if let Some(open) = descriptor
            && let Err(err) = self.inner.backend.close(open.descriptor).await
        {
            warn!(key = %entry.key(), %err, "Failed to close descriptor of reclaimed entry.");
        }
        self.inner.backend.forget(entry.handle());
        if cause != Cause::Lru {
            self.inner.lru.remove(id);
        }

        debug!(
            key = %entry.key(),
            ?cause,
            unlinked,
            children = children.len(),
            "Reclaimed entry."
        );
        Reclaim::Done
    }

    /// Reclaim every stale or invalid entry nobody holds. Returns how many were reclaimed.
    pub(crate) async fn reclaim_unusable(&self) -> usize {
        let mut candidates: Vec<Arc<CacheEntry<B>>> = Vec::new();
        self.inner.by_id.iter_sync(|_, entry| {
            if matches!(entry.validity(), Validity::Stale | Validity::Invalid)
                && entry.holders() == 0
            {
                candidates.push(Arc::clone(entry));
            }
            true
        });

        let mut reclaimed = 0;
        for entry in candidates {
            if self.reclaim(entry.id(), Cause::Unusable).await == Reclaim::Done {
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

/// Bridges LRU culls back into the cache.
pub(crate) struct Reaper<B: Backend> {
    cache: Weak<CacheInner<B>>,
}

impl<B: Backend> Reaper<B> {
    pub(crate) fn new(cache: Weak<CacheInner<B>>) -> Self {
        Self { cache }
    }
}

impl<B: Backend> Clone for Reaper<B> {
    fn clone(&self) -> Self {
        Self {
            cache: Weak::clone(&self.cache),
        }
    }
}

impl<B: Backend> Deleter<EntryId, LruStamp> for Reaper<B> {
    async fn delete(&mut self, key: EntryId, ctx: LruStamp) {
        let Some(inner) = self.cache.upgrade() else {
            return;
        };
        let cache = EntryCache { inner };
        if cache.reclaim(key, Cause::Lru).await == Reclaim::Kept {
            trace!(id = %key, "Cull candidate kept, re-queueing.");
            // Keep the entry tracked; a newer stamp posted meanwhile wins anyway.
            let _ = cache.inner.lru.upsert(key, ctx);
        }
    }
}

/// Outcome of one collector pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Stale or invalid entries reclaimed.
    pub reclaimed: usize,
    /// LRU entries handed to the culler. Culled entries that turn out to be pinned are kept.
    pub cull_requested: usize,
}

/// Periodic reclaimer of an [`EntryCache`].
///
/// Holds only a weak reference; once the cache is dropped, passes become no-ops and a spawned
/// collector exits.
pub struct GarbageCollector<B: Backend> {
    cache: Weak<CacheInner<B>>,
}

impl<B: Backend> std::fmt::Debug for GarbageCollector<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("attached", &(self.cache.strong_count() > 0))
            .finish()
    }
}

impl<B: Backend> GarbageCollector<B> {
    /// A collector for `cache`.
    #[must_use]
    pub fn new(cache: &EntryCache<B>) -> Self {
        Self {
            cache: Arc::downgrade(&cache.inner),
        }
    }

    /// Run one pass.
    pub async fn run_once(&self) -> GcReport {
        let Some(inner) = self.cache.upgrade() else {
            return GcReport::default();
        };
        let cache = EntryCache { inner };

        let reclaimed = cache.reclaim_unusable().await;

        let policy = &cache.config().gc;
        let count = cache.len();
        let mut cull_requested = 0;
        if count > policy.entries_hwmark {
            let excess = count - policy.entries_lwmark;
            let batch = u32::try_from(excess).unwrap_or(u32::MAX);
            if cache.inner.lru.try_cull(batch) {
                cull_requested = batch as usize;
            } else {
                warn!(count, "LRU worker busy, skipping cull this pass.");
            }
        }

        let report = GcReport {
            reclaimed,
            cull_requested,
        };
        debug!(?report, entries = count, "Collector pass done.");
        report
    }

    /// Run passes on the configured interval until the cache is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(period) = self
                .cache
                .upgrade()
                .map(|inner| inner.config.gc.run_interval())
            else {
                return;
            };
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if self.cache.strong_count() == 0 {
                    break;
                }
                self.run_once().await;
            }
            info!("Entry cache dropped, collector exiting.");
        })
    }
}
