//! Least-recently-validated ordering of cache entries.
//!
//! Callers never touch the ordering directly. They post messages to a single worker task that
//! owns a [`LinkedHashMap`]; culls pop from its front and hand each victim to a [`Deleter`] on a
//! task of its own. The deleter is free to refuse (the entry is busy, pinned or too young) and
//! post the key back.

use std::{
    future::Future,
    hash::Hash,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicI64, Ordering},
    },
};

use hashlink::LinkedHashMap;
use tokio::{
    sync::mpsc::{Receiver, Sender, error::TrySendError},
    task::JoinHandle,
};
use tracing::trace;

/// Values carrying a monotonic version, used to discard reordered messages.
pub trait Versioned {
    /// The version of this value.
    fn version(&self) -> u64;
}

/// Receives the keys a cull selected, oldest first.
pub trait Deleter<K, Ctx>: Send + Clone + 'static {
    /// Handle one culled key. `ctx` is the stamp it was last recorded with.
    fn delete(&mut self, key: K, ctx: Ctx) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy)]
enum Message<K, C> {
    /// Cull up to this many keys.
    Evict(u32),
    /// The key was validated; move it to the back.
    Upserted(K, C),
    /// The key left the cache.
    Removed(K),
}

/// Outstanding cull work, packed into one `AtomicI64`.
///
/// Upper 32 bits count requested culls the worker has not picked up yet, lower 32 bits count
/// deletions handed to the deleter and not yet finished. A producer bumps the upper half before
/// sending, so the indicator is never zero while a request sits in the channel. The worker moves
/// one unit from the upper half to `n` units in the lower half in a single add.
#[derive(Debug, Default)]
struct CullIndicator(AtomicI64);

impl CullIndicator {
    fn request(&self) {
        self.0.fetch_add(1 << 32, Ordering::Relaxed);
    }

    fn withdraw(&self) {
        self.0.fetch_sub(1 << 32, Ordering::Relaxed);
    }

    fn start(&self, count: u32) {
        self.0
            .fetch_add(i64::from(count) - (1 << 32), Ordering::Relaxed);
    }

    fn finish_one(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    fn busy(&self) -> bool {
        self.0.load(Ordering::Relaxed) != 0
    }
}

#[derive(Debug)]
struct Shared {
    culls: CullIndicator,
    worker: OnceLock<JoinHandle<()>>,
}

/// Decrements the in-flight count even if the deletion task is cancelled.
struct FinishOnDrop(Arc<Shared>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.culls.finish_one();
    }
}

struct LruWorker<K, C, D> {
    receiver: Receiver<Message<K, C>>,
    order: LinkedHashMap<K, C>,
    deleter: D,
    shared: Arc<Shared>,
}

impl<K, C, D> LruWorker<K, C, D>
where
    K: Copy + Eq + Hash + Send + 'static,
    C: Versioned + Send + 'static,
    D: Deleter<K, C>,
{
    fn spawn(deleter: D, receiver: Receiver<Message<K, C>>, shared: Arc<Shared>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut worker = Self {
                receiver,
                order: LinkedHashMap::new(),
                deleter,
                shared,
            };
            while let Some(msg) = worker.receiver.recv().await {
                worker.service(msg);
            }
        })
    }

    fn service(&mut self, message: Message<K, C>) {
        match message {
            Message::Upserted(key, ctx) => {
                if let Some(existing) = self.order.get(&key)
                    && ctx.version() < existing.version()
                {
                    return;
                }
                self.order.remove(&key);
                self.order.insert(key, ctx);
            }
            Message::Removed(key) => {
                self.order.remove(&key);
            }
            Message::Evict(max_count) => {
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "bounded by max_count, which is a u32"
                )]
                let take = self.order.len().min(max_count as usize) as u32;
                self.shared.culls.start(take);
                trace!(requested = max_count, take, "Culling LRU tail.");

                for _ in 0..take {
                    let Some((key, ctx)) = self.order.pop_front() else {
                        // Unreachable while `take <= len`, but keep the indicator balanced.
                        self.shared.culls.finish_one();
                        continue;
                    };
                    let mut deleter = self.deleter.clone();
                    let guard = FinishOnDrop(Arc::clone(&self.shared));
                    tokio::spawn(async move {
                        let _guard = guard;
                        deleter.delete(key, ctx).await;
                    });
                }
            }
        }
    }
}

/// Handle to the LRU worker.
#[derive(Debug)]
pub struct LruEvictionTracker<K, C> {
    sender: Sender<Message<K, C>>,
    shared: Arc<Shared>,
}

impl<K, C> LruEvictionTracker<K, C>
where
    K: Copy + Eq + Hash + Send + 'static,
    C: Versioned + Copy + Send + 'static,
{
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn<D: Deleter<K, C>>(deleter: D, channel_size: usize) -> Self {
        let (sender, receiver) = tokio::sync::mpsc::channel(channel_size);
        let shared = Arc::new(Shared {
            culls: CullIndicator::default(),
            worker: OnceLock::new(),
        });
        let worker = LruWorker::spawn(deleter, receiver, Arc::clone(&shared));
        if shared.worker.set(worker).is_err() {
            unreachable!("worker handle is set exactly once, right here");
        }
        Self { sender, shared }
    }

    /// Post a message that must not be lost to cancellation of the caller.
    ///
    /// Returns `false` only when the worker is gone.
    fn post(&self, message: Message<K, C>) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(message)) => {
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send(message).await;
                });
                true
            }
        }
    }

    /// Record `key` as the most recently validated.
    ///
    /// Returns `false` when the record could not be queued, in which case the key is not
    /// tracked.
    #[must_use]
    pub fn upsert(&self, key: K, ctx: C) -> bool {
        self.post(Message::Upserted(key, ctx))
    }

    /// Stop tracking `key`.
    pub fn remove(&self, key: K) {
        let _ = self.post(Message::Removed(key));
    }

    /// Ask the worker to cull up to `max_count` of the oldest keys.
    ///
    /// Returns `false` when the channel is full or closed; the caller may retry later.
    #[must_use]
    pub fn try_cull(&self, max_count: u32) -> bool {
        self.shared.culls.request();
        if self.sender.try_send(Message::Evict(max_count)).is_ok() {
            true
        } else {
            self.shared.culls.withdraw();
            false
        }
    }

    /// Whether a requested cull has not finished yet.
    #[must_use]
    pub fn have_pending_culls(&self) -> bool {
        self.shared.culls.busy()
    }

    /// Whether the worker task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
