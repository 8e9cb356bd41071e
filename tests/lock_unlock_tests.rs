#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{MockBackend, RecordedLockOp, new_cache, owner};
use inocache::lock::{
    BlockingProtocol, CancelStatus, LockRequest, ShareAccess, ShareDeny, ShareReservation,
    SilentNotifier, UnlockStatus,
};
use inocache::{
    CacheError, EntryCache, EntryHandle, LockDescriptor, LockManager, LockOp, LockSupport,
    LockType,
};

async fn setup(
    backend: &MockBackend,
) -> (
    EntryCache<MockBackend>,
    LockManager<MockBackend>,
    EntryHandle<MockBackend>,
) {
    let cache = new_cache(backend);
    let locks = LockManager::new(&cache, Arc::new(SilentNotifier));
    let file = cache
        .get_or_create(&backend.add_file(1), None)
        .await
        .unwrap();
    (cache, locks, file)
}

async fn granted(file: &EntryHandle<MockBackend>) -> Vec<LockDescriptor> {
    let state = file.read().await;
    let mut out: Vec<_> = state
        .file()
        .unwrap()
        .locks
        .iter()
        .filter(|e| e.is_granted())
        .map(|e| e.descriptor)
        .collect();
    out.sort_by_key(|d| d.offset);
    out
}

async fn linked(file: &EntryHandle<MockBackend>) -> usize {
    file.read().await.file().unwrap().locks.len()
}

#[tokio::test]
async fn unlocking_the_middle_splits_the_lock() {
    let backend = MockBackend::new();
    let (_cache, locks, file) = setup(&backend).await;
    let a = owner("a");

    locks
        .lock(&file, LockRequest::new(Arc::clone(&a), LockDescriptor::write(0, 100)))
        .await
        .unwrap();
    let status = locks
        .unlock(&file, &a, LockDescriptor::write(40, 20))
        .await
        .unwrap();

    assert_eq!(status, UnlockStatus::Released);
    assert_eq!(
        granted(&file).await,
        vec![
            LockDescriptor::from_bounds(LockType::Write, 0, 39),
            LockDescriptor::from_bounds(LockType::Write, 60, 99),
        ]
    );

    // Unlocking the gap again finds nothing.
    let status = locks
        .unlock(&file, &a, LockDescriptor::write(45, 5))
        .await
        .unwrap();
    assert_eq!(status, UnlockStatus::NotHeld);
}

#[tokio::test]
async fn zero_length_unlock_runs_to_end_of_file() {
    let backend = MockBackend::new();
    let (_cache, locks, file) = setup(&backend).await;
    let a = owner("a");

    locks
        .lock(&file, LockRequest::new(Arc::clone(&a), LockDescriptor::read(10, 0)))
        .await
        .unwrap();
    locks
        .unlock(&file, &a, LockDescriptor::read(50, 0))
        .await
        .unwrap();

    assert_eq!(granted(&file).await, vec![LockDescriptor::read(10, 40)]);
}

#[tokio::test]
async fn unlock_leaves_other_owners_alone() {
    let backend = MockBackend::new();
    let (_cache, locks, file) = setup(&backend).await;

    locks
        .lock(&file, LockRequest::new(owner("a"), LockDescriptor::read(0, 10)))
        .await
        .unwrap();
    let status = locks
        .unlock(&file, &owner("b"), LockDescriptor::read(0, 0))
        .await
        .unwrap();

    assert_eq!(status, UnlockStatus::NotHeld);
    assert_eq!(granted(&file).await, vec![LockDescriptor::read(0, 10)]);
}

#[tokio::test]
async fn ownerless_backend_only_unlocks_unshared_pieces() {
    let backend = MockBackend::with_lock_support(LockSupport::NoOwner);
    let (_cache, locks, file) = setup(&backend).await;
    let a = owner("a");

    locks
        .lock(&file, LockRequest::new(Arc::clone(&a), LockDescriptor::read(0, 100)))
        .await
        .unwrap();
    locks
        .lock(&file, LockRequest::new(owner("b"), LockDescriptor::read(20, 10)))
        .await
        .unwrap();
    backend.clear_lock_ops();

    locks
        .unlock(&file, &a, LockDescriptor::read(0, 100))
        .await
        .unwrap();

    assert_eq!(
        backend.lock_ops(),
        vec![
            RecordedLockOp {
                op: LockOp::Unlock,
                with_owner: false,
                descriptor: LockDescriptor::from_bounds(LockType::Read, 0, 19),
            },
            RecordedLockOp {
                op: LockOp::Unlock,
                with_owner: false,
                descriptor: LockDescriptor::from_bounds(LockType::Read, 30, 99),
            },
        ]
    );
    assert_eq!(granted(&file).await, vec![LockDescriptor::read(20, 10)]);
}

#[tokio::test]
async fn owner_aware_backend_gets_the_whole_range() {
    let backend = MockBackend::with_lock_support(LockSupport::Owner);
    let (_cache, locks, file) = setup(&backend).await;
    let a = owner("a");

    locks
        .lock(&file, LockRequest::new(Arc::clone(&a), LockDescriptor::write(0, 100)))
        .await
        .unwrap();
    backend.clear_lock_ops();
    locks
        .unlock(&file, &a, LockDescriptor::write(40, 20))
        .await
        .unwrap();

    assert_eq!(
        backend.lock_ops(),
        vec![RecordedLockOp {
            op: LockOp::Unlock,
            with_owner: true,
            descriptor: LockDescriptor::write(40, 20),
        }]
    );
}

#[tokio::test]
async fn nothing_held_means_no_down_call() {
    let backend = MockBackend::with_lock_support(LockSupport::Owner);
    let (_cache, locks, file) = setup(&backend).await;

    locks
        .lock(&file, LockRequest::new(owner("a"), LockDescriptor::write(0, 10)))
        .await
        .unwrap();
    backend.clear_lock_ops();
    locks
        .unlock(&file, &owner("a"), LockDescriptor::write(50, 10))
        .await
        .unwrap();

    assert!(backend.lock_ops().is_empty());
}

#[tokio::test]
async fn unlock_cancels_own_pending_requests() {
    let backend = MockBackend::new();
    let (_cache, locks, file) = setup(&backend).await;
    let b = owner("b");

    locks
        .lock(&file, LockRequest::new(owner("a"), LockDescriptor::write(0, 10)))
        .await
        .unwrap();
    locks
        .lock(
            &file,
            LockRequest::new(Arc::clone(&b), LockDescriptor::write(0, 10))
                .blocking(BlockingProtocol::Nlm),
        )
        .await
        .unwrap();
    assert_eq!(linked(&file).await, 2);

    let status = locks
        .unlock(&file, &b, LockDescriptor::write(0, 0))
        .await
        .unwrap();
    assert_eq!(status, UnlockStatus::Released);
    assert_eq!(linked(&file).await, 1);
}

#[tokio::test]
async fn unlock_of_a_directory_is_rejected() {
    let backend = MockBackend::new();
    let (cache, locks, _file) = setup(&backend).await;
    let dir = cache
        .get_or_create(&backend.add_dir(2), None)
        .await
        .unwrap();

    assert!(matches!(
        locks
            .unlock(&dir, &owner("a"), LockDescriptor::read(0, 0))
            .await,
        Err(CacheError::BadType)
    ));
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let backend = MockBackend::new();
    let (_cache, locks, file) = setup(&backend).await;
    let b = owner("b");
    let wanted = LockDescriptor::write(0, 10);

    locks
        .lock(&file, LockRequest::new(owner("a"), wanted))
        .await
        .unwrap();
    locks
        .lock(
            &file,
            LockRequest::new(Arc::clone(&b), wanted)
                .blocking(BlockingProtocol::Nlm)
                .with_cookie(Bytes::from_static(b"cookie")),
        )
        .await
        .unwrap();

    assert_eq!(
        locks
            .cancel(&file, &b, wanted, Some(&b"other"[..]))
            .await
            .unwrap(),
        CancelStatus::NotFound,
        "cookie must match"
    );
    assert_eq!(
        locks
            .cancel(&file, &b, wanted, Some(&b"cookie"[..]))
            .await
            .unwrap(),
        CancelStatus::Found
    );
    assert_eq!(
        locks.cancel(&file, &b, wanted, None).await.unwrap(),
        CancelStatus::NotFound
    );
    assert_eq!(linked(&file).await, 1);
}

#[tokio::test]
async fn cancel_does_not_touch_granted_locks() {
    let backend = MockBackend::new();
    let (_cache, locks, file) = setup(&backend).await;
    let a = owner("a");

    locks
        .lock(&file, LockRequest::new(Arc::clone(&a), LockDescriptor::write(0, 10)))
        .await
        .unwrap();
    assert_eq!(
        locks
            .cancel(&file, &a, LockDescriptor::write(0, 10), None)
            .await
            .unwrap(),
        CancelStatus::NotFound
    );
    assert_eq!(granted(&file).await, vec![LockDescriptor::write(0, 10)]);
}

#[tokio::test]
async fn releasing_an_owner_clears_every_file() {
    let backend = MockBackend::new();
    let cache = new_cache(&backend);
    let locks = LockManager::new(&cache, Arc::new(SilentNotifier));
    let a = owner("a");

    let f1 = cache.get_or_create(&backend.add_file(1), None).await.unwrap();
    let f2 = cache.get_or_create(&backend.add_file(2), None).await.unwrap();
    for file in [&f1, &f2] {
        locks
            .lock(file, LockRequest::new(Arc::clone(&a), LockDescriptor::write(0, 10)))
            .await
            .unwrap();
        locks
            .lock(file, LockRequest::new(Arc::clone(&a), LockDescriptor::read(100, 10)))
            .await
            .unwrap();
    }
    locks
        .lock(&f1, LockRequest::new(owner("b"), LockDescriptor::read(500, 1)))
        .await
        .unwrap();

    assert_eq!(locks.release_owner(&a).await.unwrap(), 2);
    assert!(cache.registry().files_of(&a).is_empty());
    assert_eq!(granted(&f1).await, vec![LockDescriptor::read(500, 1)]);
    assert!(granted(&f2).await.is_empty());
    assert!(!cache.registry().has_holdings(f2.key()));
    assert!(cache.registry().has_holdings(f1.key()));

    assert_eq!(locks.release_owner(&a).await.unwrap(), 0);
}

#[tokio::test]
async fn unlock_owner_on_one_file() {
    let backend = MockBackend::new();
    let (_cache, locks, file) = setup(&backend).await;
    let a = owner("a");

    locks
        .lock(&file, LockRequest::new(Arc::clone(&a), LockDescriptor::write(0, 10)))
        .await
        .unwrap();
    assert_eq!(
        locks.unlock_owner(&file, &a).await.unwrap(),
        UnlockStatus::Released
    );
    assert_eq!(
        locks.unlock_owner(&file, &a).await.unwrap(),
        UnlockStatus::NotHeld
    );
}

#[tokio::test]
async fn share_reservations_deny_clashing_opens() {
    let backend = MockBackend::new();
    let (_cache, locks, file) = setup(&backend).await;
    let (a, b) = (owner("a"), owner("b"));

    locks
        .add_share(
            &file,
            ShareReservation {
                owner: Arc::clone(&a),
                access: ShareAccess::READ,
                deny: ShareDeny::WRITE,
            },
        )
        .await
        .unwrap();

    let writer = ShareReservation {
        owner: Arc::clone(&b),
        access: ShareAccess::WRITE,
        deny: ShareDeny::empty(),
    };
    assert!(matches!(
        locks.add_share(&file, writer.clone()).await,
        Err(CacheError::ShareDenied)
    ));
    locks
        .add_share(
            &file,
            ShareReservation {
                owner: Arc::clone(&b),
                access: ShareAccess::READ,
                deny: ShareDeny::empty(),
            },
        )
        .await
        .unwrap();

    assert_eq!(locks.remove_share(&file, &a).await.unwrap(), 1);
    locks.add_share(&file, writer).await.unwrap();
    assert_eq!(file.read().await.file().unwrap().shares.len(), 2);
}

#[tokio::test]
async fn failed_unlock_down_call_leaves_locks_in_place() {
    let backend = MockBackend::with_lock_support(LockSupport::Owner);
    let (cache, locks, file) = setup(&backend).await;
    let (a, b) = (owner("a"), owner("b"));

    locks
        .lock(&file, LockRequest::new(Arc::clone(&a), LockDescriptor::write(0, 100)))
        .await
        .unwrap();
    locks
        .lock(&file, LockRequest::new(b, LockDescriptor::write(200, 10)))
        .await
        .unwrap();
    locks
        .lock(
            &file,
            LockRequest::new(Arc::clone(&a), LockDescriptor::write(200, 10))
                .blocking(BlockingProtocol::Nlm),
        )
        .await
        .unwrap();
    backend.make_stale(file.handle());

    let result = locks
        .unlock(&file, &a, LockDescriptor::write(40, 20))
        .await;
    assert!(matches!(result, Err(CacheError::BackendStale)));
    assert_eq!(
        granted(&file).await,
        vec![LockDescriptor::write(0, 100), LockDescriptor::write(200, 10)]
    );

    let result = locks.unlock_owner(&file, &a).await;
    assert!(matches!(result, Err(CacheError::BackendStale)));
    assert_eq!(
        granted(&file).await,
        vec![LockDescriptor::write(0, 100), LockDescriptor::write(200, 10)]
    );
    assert_eq!(linked(&file).await, 3, "a's pending request is kept too");
    assert_eq!(cache.registry().files_of(&a), vec![file.key().clone()]);
}
