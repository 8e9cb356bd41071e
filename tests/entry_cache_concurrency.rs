#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;

use common::{MockBackend, new_cache, new_cache_with, owner, wait_for_cache_culls};
use inocache::lock::{LockRequest, SilentNotifier};
use inocache::{CacheConfig, GarbageCollector, LockDescriptor, LockManager};
use tokio::task::JoinSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creators_share_one_entry() {
    let backend = MockBackend::new();
    let h = backend.add_file(1);
    let cache = new_cache(&backend);

    let mut set = JoinSet::new();
    for _ in 0..64 {
        let cache = cache.clone();
        let h = h.clone();
        set.spawn(async move { cache.get_or_create(&h, None).await.unwrap() });
    }
    let mut handles = Vec::new();
    while let Some(joined) = set.join_next().await {
        handles.push(joined.unwrap());
    }

    assert_eq!(cache.len(), 1);
    assert!(handles.iter().all(|e| e.same_entry(&handles[0])));
    assert_eq!(handles[0].holders(), 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lookups_racing_the_collector_never_see_two_entries() {
    let mut config = CacheConfig::default();
    config.gc.entries_hwmark = 8;
    config.gc.entries_lwmark = 0;
    let backend = MockBackend::new();
    let handles: Vec<_> = (0..32).map(|n| backend.add_file(n)).collect();
    let cache = new_cache_with(&backend, config);
    let gc = GarbageCollector::new(&cache);

    let mut set = JoinSet::new();
    for worker in 0..4 {
        let cache = cache.clone();
        let handles = handles.clone();
        set.spawn(async move {
            for round in 0..50 {
                let h = &handles[(worker * 7 + round) % handles.len()];
                let held = cache.get_or_create(h, None).await.unwrap();
                let again = cache.get(&cache.key_for(h)).await.unwrap();
                assert!(held.same_entry(&again), "a held entry is never replaced");
                tokio::task::yield_now().await;
            }
        });
    }
    for _ in 0..20 {
        gc.run_once().await;
        tokio::task::yield_now().await;
    }
    while let Some(joined) = set.join_next().await {
        joined.unwrap();
    }
    wait_for_cache_culls(&cache).await;
    assert!(cache.len() <= handles.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_lockers_all_succeed() {
    let backend = MockBackend::new();
    let cache = new_cache(&backend);
    let locks = Arc::new(LockManager::new(&cache, Arc::new(SilentNotifier)));
    let file = cache
        .get_or_create(&backend.add_file(1), None)
        .await
        .unwrap();

    let mut set = JoinSet::new();
    for n in 0u64..32 {
        let locks = Arc::clone(&locks);
        let file = file.clone();
        set.spawn(async move {
            let who = owner(if n % 2 == 0 { "even" } else { "odd" });
            let range = LockDescriptor::write(n * 10, 5);
            locks
                .lock(&file, LockRequest::new(Arc::clone(&who), range))
                .await
                .unwrap();
            locks.unlock(&file, &who, range).await.unwrap();
        });
    }
    while let Some(joined) = set.join_next().await {
        joined.unwrap();
    }

    assert!(file.read().await.file().unwrap().locks.is_empty());
    assert!(!cache.registry().has_holdings(file.key()));
}
