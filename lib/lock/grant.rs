//! Asynchronous grant delivery.
//!
//! Whenever a lock leaves a file that still has pending requests, the file is queued here. A
//! single worker re-evaluates the file's pending requests off the caller's path and tells the
//! protocol layer which ones it granted. Notifications go out after the entry lock is released.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

use super::{BlockingProtocol, LockDescriptor, LockOwner, manager::LockCore};
use crate::{
    backend::Backend,
    cache::{CacheEntry, HandleKey},
};

/// What became of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    /// The lock is now held.
    Granted,
    /// The backend refused the lock; the request was dropped.
    Denied,
}

/// Message to the requester of a formerly blocked lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantNotice {
    /// File the lock is on.
    pub key: HandleKey,
    /// Requester.
    pub owner: Arc<LockOwner>,
    /// The range as originally requested.
    pub descriptor: LockDescriptor,
    /// Cookie from the original request.
    pub cookie: Bytes,
    /// Where to deliver the notice.
    pub protocol: BlockingProtocol,
    /// Granted or denied.
    pub outcome: GrantOutcome,
}

/// Delivery failed; a granted lock is revoked again.
#[derive(Debug, Error)]
#[error("grant notification failed: {reason}")]
pub struct NotifyError {
    /// Human readable cause.
    pub reason: String,
}

impl NotifyError {
    /// An error with the given cause.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Protocol-side sink for grant notices, routed by [`GrantNotice::protocol`].
#[async_trait]
pub trait GrantNotifier: Send + Sync {
    /// Deliver one notice. An error on a granted notice revokes the lock.
    async fn notify(&self, notice: &GrantNotice) -> Result<(), NotifyError>;
}

/// Accepts and discards every notice.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentNotifier;

#[async_trait]
impl GrantNotifier for SilentNotifier {
    async fn notify(&self, notice: &GrantNotice) -> Result<(), NotifyError> {
        trace!(key = %notice.key, descriptor = %notice.descriptor, "Discarding grant notice.");
        Ok(())
    }
}

/// Decrements the pending count when a job is finished or abandoned.
struct JobDone(Arc<AtomicUsize>);

impl Drop for JobDone {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Sender side of the grant worker.
pub(crate) struct GrantQueue<B: Backend> {
    sender: mpsc::Sender<Arc<CacheEntry<B>>>,
    pending: Arc<AtomicUsize>,
}

impl<B: Backend> GrantQueue<B> {
    pub(crate) fn spawn(core: Arc<LockCore<B>>, channel_size: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Arc<CacheEntry<B>>>(channel_size);
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(entry) = receiver.recv().await {
                let _done = JobDone(Arc::clone(&worker_pending));
                // A revoked grant frees its range again; keep going until the file settles.
                while core.regrant(&entry).await {}
            }
        });
        Self { sender, pending }
    }

    /// Queue `entry` for re-evaluation. Never waits.
    pub(crate) fn schedule(&self, entry: &Arc<CacheEntry<B>>) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.sender.try_send(Arc::clone(entry)) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
            Err(TrySendError::Full(entry)) => {
                let sender = self.sender.clone();
                let pending = Arc::clone(&self.pending);
                tokio::spawn(async move {
                    if sender.send(entry).await.is_err() {
                        pending.fetch_sub(1, Ordering::AcqRel);
                    }
                });
            }
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }
}
