#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use inocache::cache::eviction::lru::{Deleter, LruEvictionTracker, Versioned};
use inocache::lock::{GrantNotice, GrantNotifier, NotifyError};
use inocache::trc::Trc;
use inocache::{
    Attributes, Backend, BackendError, BackendHandle, CacheConfig, EntryCache, EntryType,
    LockDescriptor, LockManager, LockOp, LockOwner, LockSupport, StateRegistry,
};

/// Minimal versioned context for LRU tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MockCtx {
    pub version: u64,
}

impl Versioned for MockCtx {
    fn version(&self) -> u64 {
        self.version
    }
}

/// A mock deleter that records every (key, ctx) pair it receives.
#[derive(Clone)]
pub struct MockDeleter {
    pub deleted: Arc<Mutex<Vec<(u64, MockCtx)>>>,
}

impl MockDeleter {
    pub fn new() -> Self {
        Self {
            deleted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns just the keys that were deleted, in deletion order.
    pub fn deleted_keys(&self) -> Vec<u64> {
        self.deleted
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| *k)
            .collect()
    }
}

impl Deleter<u64, MockCtx> for MockDeleter {
    async fn delete(&mut self, key: u64, ctx: MockCtx) {
        self.deleted.lock().unwrap().push((key, ctx));
    }
}

/// Poll `have_pending_culls()` until it returns false, or panic after timeout.
pub async fn wait_for_culls(tracker: &LruEvictionTracker<u64, MockCtx>) {
    for _ in 0..200 {
        if !tracker.have_pending_culls() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("culls did not complete within 1 second");
}

/// Same as [`wait_for_culls`], for the cache's own tracker.
pub async fn wait_for_cache_culls(cache: &EntryCache<MockBackend>) {
    for _ in 0..200 {
        if !cache.have_pending_culls() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("cache culls did not complete within 1 second");
}

/// Poll until the grant worker is idle, or panic after timeout.
pub async fn wait_for_grants(manager: &LockManager<MockBackend>) {
    for _ in 0..200 {
        if !manager.have_pending_grants() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("grants did not settle within 1 second");
}

pub fn init_tracing() {
    let _ = Trc::for_tests().with_filter("inocache=trace").init();
}

/// Descriptor handed out by [`MockBackend::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockDescriptor(pub u64);

/// One recorded lock down-call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedLockOp {
    pub op: LockOp,
    pub with_owner: bool,
    pub descriptor: LockDescriptor,
}

pub struct MockState {
    pub objects: HashMap<Bytes, Attributes>,
    pub stale: HashSet<Bytes>,
    pub lock_support: LockSupport,
    pub lock_ops: Vec<RecordedLockOp>,
    pub refuse_locks: bool,
    pub test_conflict: Option<LockDescriptor>,
    pub fetches: usize,
    pub opens: u64,
    pub closes: usize,
    pub fail_close: bool,
    pub forgotten: Vec<Bytes>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            stale: HashSet::new(),
            lock_support: LockSupport::None,
            lock_ops: Vec::new(),
            refuse_locks: false,
            test_conflict: None,
            fetches: 0,
            opens: 0,
            closes: 0,
            fail_close: false,
            forgotten: Vec::new(),
        }
    }
}

/// Scriptable in-memory backend.
#[derive(Clone, Default)]
pub struct MockBackend {
    pub state: Arc<Mutex<MockState>>,
}

pub fn handle(n: u64) -> BackendHandle {
    BackendHandle::new(format!("h{n}").into_bytes())
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_support(support: LockSupport) -> Self {
        let backend = Self::new();
        backend.state.lock().unwrap().lock_support = support;
        backend
    }

    pub fn add(&self, n: u64, entry_type: EntryType) -> BackendHandle {
        let h = handle(n);
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(h.0.clone(), Attributes::new(entry_type, n));
        h
    }

    pub fn add_file(&self, n: u64) -> BackendHandle {
        self.add(n, EntryType::RegularFile)
    }

    pub fn add_dir(&self, n: u64) -> BackendHandle {
        self.add(n, EntryType::Directory)
    }

    pub fn make_stale(&self, h: &BackendHandle) {
        let mut state = self.state.lock().unwrap();
        state.objects.remove(&h.0);
        state.stale.insert(h.0.clone());
    }

    pub fn replace(&self, h: &BackendHandle, attributes: Attributes) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(h.0.clone(), attributes);
    }

    pub fn lock_ops(&self) -> Vec<RecordedLockOp> {
        self.state.lock().unwrap().lock_ops.clone()
    }

    pub fn clear_lock_ops(&self) {
        self.state.lock().unwrap().lock_ops.clear();
    }

    pub fn fetches(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    pub fn opens(&self) -> u64 {
        self.state.lock().unwrap().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn forgotten(&self) -> usize {
        self.state.lock().unwrap().forgotten.len()
    }
}

impl Backend for MockBackend {
    type Descriptor = MockDescriptor;

    async fn fetch_attributes(&self, handle: &BackendHandle) -> Result<Attributes, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        match state.objects.get(&handle.0) {
            Some(attributes) => Ok(attributes.clone()),
            None => Err(BackendError::Stale),
        }
    }

    fn digest_handle(&self, handle: &BackendHandle) -> Bytes {
        handle.0.clone()
    }

    fn lock_support(&self) -> LockSupport {
        self.state.lock().unwrap().lock_support
    }

    async fn lock_op(
        &self,
        handle: &BackendHandle,
        owner: Option<&LockOwner>,
        op: LockOp,
        descriptor: LockDescriptor,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.lock_ops.push(RecordedLockOp {
            op,
            with_owner: owner.is_some(),
            descriptor,
        });
        if state.stale.contains(&handle.0) {
            return Err(BackendError::Stale);
        }
        match op {
            LockOp::Lock if state.refuse_locks => {
                Err(BackendError::Io(std::io::Error::other("lock refused")))
            }
            LockOp::Test => state
                .test_conflict
                .map_or(Ok(()), |held| Err(BackendError::LockConflict(held))),
            _ => Ok(()),
        }
    }

    async fn open(&self, handle: &BackendHandle) -> Result<MockDescriptor, BackendError> {
        let mut state = self.state.lock().unwrap();
        if !state.objects.contains_key(&handle.0) {
            return Err(BackendError::Stale);
        }
        state.opens += 1;
        Ok(MockDescriptor(state.opens))
    }

    async fn close(&self, _descriptor: MockDescriptor) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        if state.fail_close {
            return Err(BackendError::Io(std::io::Error::other("close failed")));
        }
        Ok(())
    }

    fn forget(&self, handle: &BackendHandle) {
        self.state.lock().unwrap().forgotten.push(handle.0.clone());
    }
}

/// Records every notice; optionally refuses delivery.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub notices: Arc<Mutex<Vec<GrantNotice>>>,
    pub fail: Arc<AtomicBool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.fail.store(true, Ordering::SeqCst);
        notifier
    }

    pub fn notices(&self) -> Vec<GrantNotice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl GrantNotifier for RecordingNotifier {
    async fn notify(&self, notice: &GrantNotice) -> Result<(), NotifyError> {
        self.notices.lock().unwrap().push(notice.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::new("client unreachable"));
        }
        Ok(())
    }
}

pub fn new_cache(backend: &MockBackend) -> EntryCache<MockBackend> {
    new_cache_with(backend, CacheConfig::default())
}

pub fn new_cache_with(backend: &MockBackend, config: CacheConfig) -> EntryCache<MockBackend> {
    EntryCache::new(backend.clone(), config, Arc::new(StateRegistry::default()))
}

pub fn owner(name: &'static str) -> Arc<LockOwner> {
    Arc::new(LockOwner::new(inocache::lock::OwnerKind::Nlm, "client", name))
}
