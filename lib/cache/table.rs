//! The handle-keyed entry table.

use std::{
    ffi::{OsStr, OsString},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use scc::hash_map::Entry;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use super::{
    dirents::Dirent,
    entry::{CacheEntry, EntryHandle, EntryState, OpenDescriptor, ParentLink, Payload, Validity},
    eviction::lru::{LruEvictionTracker, Versioned},
    gc::Reaper,
    key::{EntryId, HandleKey},
};
use crate::{
    backend::{Attributes, Backend, BackendHandle},
    config::CacheConfig,
    error::{BackendError, CacheError},
    registry::StateRegistry,
};

/// Why an entry is being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateOp {
    /// The entry is being read.
    Get,
    /// The entry's attributes or contents changed.
    Set,
}

/// Position of an entry in the LRU order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LruStamp {
    version: u64,
}

impl Versioned for LruStamp {
    fn version(&self) -> u64 {
        self.version
    }
}

pub(crate) struct CacheInner<B: Backend> {
    pub(crate) backend: B,
    pub(crate) config: CacheConfig,
    pub(crate) registry: Arc<StateRegistry>,
    pub(crate) by_key: scc::HashMap<HandleKey, Arc<CacheEntry<B>>>,
    pub(crate) by_id: scc::HashMap<EntryId, Arc<CacheEntry<B>>>,
    pub(crate) lru: LruEvictionTracker<EntryId, LruStamp>,
    next_id: AtomicU64,
    lru_clock: AtomicU64,
}

/// Concurrent cache of backend objects keyed by [`HandleKey`].
///
/// At most one [`CacheEntry`] exists per key. Entries are handed out as [`EntryHandle`]s; an
/// entry with outstanding handles is never reclaimed. Cloning the cache is cheap and every clone
/// shares the same table.
pub struct EntryCache<B: Backend> {
    pub(crate) inner: Arc<CacheInner<B>>,
}

impl<B: Backend> Clone for EntryCache<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for EntryCache<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCache")
            .field("entries", &self.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> EntryCache<B> {
    /// Build a cache and start its LRU worker. Must be called inside a tokio runtime.
    pub fn new(backend: B, config: CacheConfig, registry: Arc<StateRegistry>) -> Self {
        let channel_size = config.lru_channel_size;
        let inner = Arc::new_cyclic(|weak| CacheInner {
            lru: LruEvictionTracker::spawn(Reaper::new(weak.clone()), channel_size),
            backend,
            config,
            registry,
            by_key: scc::HashMap::default(),
            by_id: scc::HashMap::default(),
            next_id: AtomicU64::new(1),
            lru_clock: AtomicU64::new(0),
        });
        Self { inner }
    }

    /// The backend below this cache.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The lock state registry shared with the lock manager.
    #[must_use]
    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.inner.registry
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.by_key.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether LRU culls are queued or running.
    #[must_use]
    pub fn have_pending_culls(&self) -> bool {
        self.inner.lru.have_pending_culls()
    }

    /// Cache key of a backend handle.
    #[must_use]
    pub fn key_for(&self, handle: &BackendHandle) -> HandleKey {
        HandleKey::new(self.inner.backend.digest_handle(handle))
    }

    /// Look up an entry without creating it.
    pub async fn get(&self, key: &HandleKey) -> Option<EntryHandle<B>> {
        self.inner
            .by_key
            .read_async(key, |_, entry| EntryHandle::acquire(entry))
            .await
    }

    pub(crate) async fn peek(&self, key: &HandleKey) -> Option<Arc<CacheEntry<B>>> {
        self.inner
            .by_key
            .read_async(key, |_, entry| Arc::clone(entry))
            .await
    }

    /// Insert a new entry for `handle`.
    ///
    /// Fails with [`CacheError::AlreadyExists`] when the handle is already cached.
    pub async fn insert(
        &self,
        handle: BackendHandle,
        attributes: Attributes,
    ) -> Result<EntryHandle<B>, CacheError> {
        let key = self.key_for(&handle);
        self.insert_keyed(key, handle, attributes).await
    }

    async fn insert_keyed(
        &self,
        key: HandleKey,
        handle: BackendHandle,
        attributes: Attributes,
    ) -> Result<EntryHandle<B>, CacheError> {
        let id = EntryId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(CacheEntry::new(id, key.clone(), handle, attributes));

        let held = match self.inner.by_key.entry_async(key).await {
            Entry::Occupied(_) => return Err(CacheError::AlreadyExists),
            Entry::Vacant(vacant) => {
                let held = EntryHandle::acquire(&entry);
                vacant.insert_entry(Arc::clone(&entry));
                held
            }
        };
        let _ = self.inner.by_id.insert_async(id, Arc::clone(&entry)).await;

        let mut state = entry.write().await;
        if let Err(err) = self.validate(&entry, &mut state, ValidateOp::Get).await {
            entry.set_validity(Validity::Recycled);
            drop(state);
            let _ = self
                .inner
                .by_key
                .remove_if_async(entry.key(), |cached| Arc::ptr_eq(cached, &entry))
                .await;
            let _ = self.inner.by_id.remove_async(&id).await;
            warn!(key = %entry.key(), %err, "Discarding entry that failed validation.");
            return Err(err);
        }
        drop(state);

        debug!(key = %entry.key(), id = %id, entry_type = ?entry.entry_type(), "Cached new entry.");
        Ok(held)
    }

    /// Return the cached entry for `handle`, creating it if needed.
    ///
    /// `attrs_hint` spares the backend fetch when the caller already has fresh attributes.
    /// Concurrent callers for the same handle all receive the same entry; the losers of the
    /// insert race drop their allocation.
    #[instrument(
        name = "EntryCache::get_or_create",
        skip(self, handle, attrs_hint),
        fields(handle = %handle)
    )]
    pub async fn get_or_create(
        &self,
        handle: &BackendHandle,
        attrs_hint: Option<Attributes>,
    ) -> Result<EntryHandle<B>, CacheError> {
        let key = self.key_for(handle);
        loop {
            if let Some(found) = self.get(&key).await {
                match found.validity() {
                    Validity::Recycled => continue,
                    Validity::Stale => return Err(CacheError::BackendStale),
                    Validity::Invalid => {
                        self.refetch(&found).await?;
                        return Ok(found);
                    }
                    Validity::Valid => {
                        let mut state = found.write().await;
                        self.validate(&found, &mut state, ValidateOp::Get).await?;
                        drop(state);
                        return Ok(found);
                    }
                }
            }

            let attributes = match &attrs_hint {
                Some(attrs) => attrs.clone(),
                None => self.inner.backend.fetch_attributes(handle).await?,
            };
            match self.insert_keyed(key.clone(), handle.clone(), attributes).await {
                Err(CacheError::AlreadyExists) => {
                    trace!("Lost insert race, retrying lookup.");
                }
                other => return other,
            }
        }
    }

    /// Record a use of `entry`. The caller holds the write lock and passes its state.
    ///
    /// Moves the entry to the back of the LRU order and marks it valid unless it is stale.
    /// Stamps the read time for [`ValidateOp::Get`], the modification and refresh times for
    /// [`ValidateOp::Set`]. A cached descriptor idle past retention is closed; a failing close
    /// is logged and does not fail validation.
    pub async fn validate(
        &self,
        entry: &CacheEntry<B>,
        state: &mut EntryState<B>,
        op: ValidateOp,
    ) -> Result<(), CacheError> {
        let stamp = LruStamp {
            version: self.inner.lru_clock.fetch_add(1, Ordering::Relaxed),
        };
        if !self.inner.lru.upsert(entry.id(), stamp) {
            warn!(key = %entry.key(), "LRU worker is gone, cannot track entry.");
            return Err(CacheError::AllocationFailure);
        }

        if matches!(entry.validity(), Validity::Valid | Validity::Invalid) {
            entry.set_validity(Validity::Valid);
        }

        let now = Instant::now();
        match op {
            ValidateOp::Get => state.times.read = now,
            ValidateOp::Set => {
                state.times.modified = now;
                state.times.refresh = now;
            }
        }

        let retention = self.inner.config.descriptor.retention();
        if let Payload::File(file) = &mut state.payload
            && file
                .descriptor
                .as_ref()
                .is_some_and(|open| now.duration_since(open.last_used) >= retention)
            && let Some(open) = file.descriptor.take()
        {
            match self.inner.backend.close(open.descriptor).await {
                Ok(()) => trace!(key = %entry.key(), "Closed idle descriptor."),
                Err(err) => warn!(key = %entry.key(), %err, "Failed to close idle descriptor."),
            }
        }

        Ok(())
    }

    /// Current attributes of `entry`, re-fetched once the attribute grace period has passed.
    pub async fn refresh(&self, entry: &EntryHandle<B>) -> Result<Attributes, CacheError> {
        if entry.validity() == Validity::Valid {
            let state = entry.read().await;
            if state.times.refresh.elapsed() < self.inner.config.attr_grace_period() {
                return Ok(state.attributes.clone());
            }
        }
        self.refetch(entry).await
    }

    async fn refetch(&self, entry: &EntryHandle<B>) -> Result<Attributes, CacheError> {
        if entry.validity() == Validity::Stale {
            return Err(CacheError::BackendStale);
        }
        let attributes = match self.inner.backend.fetch_attributes(entry.handle()).await {
            Ok(attributes) if attributes.entry_type == entry.entry_type() => attributes,
            Ok(attributes) => {
                warn!(
                    key = %entry.key(),
                    cached = ?entry.entry_type(),
                    fetched = ?attributes.entry_type,
                    "Backend object changed type, treating handle as stale."
                );
                self.mark_stale(entry).await;
                return Err(CacheError::BackendStale);
            }
            Err(BackendError::Stale) => {
                self.mark_stale(entry).await;
                return Err(CacheError::BackendStale);
            }
            Err(err) => return Err(err.into()),
        };

        let mut state = entry.write().await;
        state.attributes = attributes.clone();
        state.times.refresh = Instant::now();
        self.validate(entry, &mut state, ValidateOp::Get).await?;
        Ok(attributes)
    }

    /// Replace the attribute snapshot after a modification.
    pub async fn set_attributes(
        &self,
        entry: &EntryHandle<B>,
        attributes: Attributes,
    ) -> Result<(), CacheError> {
        if attributes.entry_type != entry.entry_type() {
            return Err(CacheError::BadType);
        }
        let mut state = entry.write().await;
        self.validate(entry, &mut state, ValidateOp::Set).await?;
        state.attributes = attributes;
        Ok(())
    }

    /// Mark `entry` invalid so it is reclaimed once nobody holds it.
    pub async fn invalidate(&self, entry: &EntryHandle<B>) {
        let _state = entry.write().await;
        if entry.validity() == Validity::Valid {
            entry.set_validity(Validity::Invalid);
            debug!(key = %entry.key(), "Invalidated entry.");
        }
    }

    /// Mark `entry` stale and remove every dirent naming it.
    ///
    /// Parents are locked one at a time; the caller must not hold any entry lock. Returns the
    /// number of dirents removed.
    #[instrument(name = "EntryCache::mark_stale", skip(self, entry), fields(key = %entry.key()))]
    pub async fn mark_stale(&self, entry: &CacheEntry<B>) -> usize {
        let links = {
            let mut state = entry.write().await;
            if entry.validity() != Validity::Recycled {
                entry.set_validity(Validity::Stale);
            }
            std::mem::take(&mut state.parent_links)
        };
        let removed = self.unlink_from_parents(entry.key(), links).await;
        debug!(removed, "Entry is stale.");
        removed
    }

    /// Remove the dirents `links` point at, if they still name `child`.
    pub(crate) async fn unlink_from_parents(
        &self,
        child: &HandleKey,
        links: Vec<ParentLink>,
    ) -> usize {
        let mut removed = 0;
        for link in links {
            let Some(parent) = self.peek(&link.parent).await else {
                continue;
            };
            let mut state = parent.write().await;
            let Ok(dir) = state.dir_mut() else {
                continue;
            };
            if dir
                .get_by_cookie(link.cookie)
                .is_some_and(|dirent| dirent.child == *child)
            {
                dir.remove_by_cookie(link.cookie);
                removed += 1;
                trace!(parent = %link.parent, cookie = link.cookie, "Removed dirent.");
            }
        }
        removed
    }

    /// Drop back-links of `child` that point into `parent`.
    pub(crate) async fn forget_parent(&self, child: &HandleKey, parent: &HandleKey) {
        if let Some(child) = self.peek(child).await {
            child
                .write()
                .await
                .parent_links
                .retain(|link| link.parent != *parent);
        }
    }

    /// Name `child` in directory `parent`.
    ///
    /// Fails with [`CacheError::BadType`] when `parent` is not a directory and with
    /// [`CacheError::AlreadyExists`] when the name or cookie is taken.
    pub async fn add_dirent(
        &self,
        parent: &EntryHandle<B>,
        name: impl Into<OsString>,
        child: &EntryHandle<B>,
        cookie: u64,
    ) -> Result<(), CacheError> {
        if !parent.entry_type().is_dir() {
            return Err(CacheError::BadType);
        }
        let name = name.into();
        {
            let mut state = parent.write().await;
            let dir = state.dir_mut()?;
            dir.insert(Dirent {
                name: name.clone(),
                cookie,
                child: child.key().clone(),
            })
            .map_err(|_| CacheError::AlreadyExists)?;
            state.times.modified = Instant::now();
        }
        child.write().await.parent_links.push(ParentLink {
            parent: parent.key().clone(),
            cookie,
        });
        trace!(parent = %parent.key(), ?name, cookie, child = %child.key(), "Added dirent.");
        Ok(())
    }

    /// Remove the dirent `name` from `parent` and return the key it named.
    pub async fn remove_dirent(
        &self,
        parent: &EntryHandle<B>,
        name: &OsStr,
    ) -> Result<HandleKey, CacheError> {
        let removed = {
            let mut state = parent.write().await;
            let dirent = state
                .dir_mut()?
                .remove_by_name(name)
                .ok_or(CacheError::NotFound)?;
            state.times.modified = Instant::now();
            dirent
        };
        if let Some(child) = self.peek(&removed.child).await {
            child
                .write()
                .await
                .parent_links
                .retain(|link| !(link.parent == *parent.key() && link.cookie == removed.cookie));
        }
        Ok(removed.child)
    }

    /// The cached child called `name` in `parent`.
    ///
    /// `Ok(None)` when the name is unknown or the child is no longer cached.
    pub async fn lookup_dirent(
        &self,
        parent: &EntryHandle<B>,
        name: &OsStr,
    ) -> Result<Option<EntryHandle<B>>, CacheError> {
        let child = {
            let state = parent.read().await;
            state.dir()?.get(name).map(|dirent| dirent.child.clone())
        };
        let Some(child) = child else {
            return Ok(None);
        };
        match self.get(&child).await {
            Some(found) if found.validity() == Validity::Stale => Err(CacheError::BackendStale),
            found => Ok(found),
        }
    }

    /// Dirents of `parent` with a cookie greater than `after_cookie`, in cookie order.
    pub async fn readdir(
        &self,
        parent: &EntryHandle<B>,
        after_cookie: u64,
    ) -> Result<Vec<Dirent>, CacheError> {
        let mut state = parent.write().await;
        let dirents: Vec<Dirent> = state.dir()?.after_cookie(after_cookie).cloned().collect();
        self.validate(parent, &mut state, ValidateOp::Get).await?;
        Ok(dirents)
    }

    /// Run `f` with the file's backend descriptor, opening it if needed.
    ///
    /// With the descriptor cache disabled the descriptor is closed again right after `f`.
    pub async fn with_descriptor<R>(
        &self,
        entry: &EntryHandle<B>,
        f: impl FnOnce(&B::Descriptor) -> R,
    ) -> Result<R, CacheError> {
        let mut state = entry.write().await;
        let cached = state.file_mut()?.descriptor.take();
        let mut open = match cached {
            Some(open) => open,
            None => match self.inner.backend.open(entry.handle()).await {
                Ok(descriptor) => {
                    trace!(key = %entry.key(), "Opened descriptor.");
                    OpenDescriptor {
                        descriptor,
                        last_used: Instant::now(),
                    }
                }
                Err(BackendError::Stale) => {
                    drop(state);
                    self.mark_stale(entry).await;
                    return Err(CacheError::BackendStale);
                }
                Err(err) => return Err(err.into()),
            },
        };

        open.last_used = Instant::now();
        let out = f(&open.descriptor);

        if self.inner.config.descriptor.use_fd_cache {
            state.file_mut()?.descriptor = Some(open);
        } else {
            drop(state);
            if let Err(err) = self.inner.backend.close(open.descriptor).await {
                warn!(key = %entry.key(), %err, "Failed to close descriptor.");
            }
        }
        Ok(out)
    }
}
