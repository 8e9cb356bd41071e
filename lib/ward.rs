//! Counted keys with a cleanup hook.
//!
//! [`Ward`] keeps a count per key and runs a type-selected cleanup against a shared context
//! when a key's count returns to zero. The registry uses it to know, for each lock owner and
//! file, how many lock entries are outstanding, and to drop its owner/file index rows when the
//! last one goes away.
//!
//! ```ignore
//! struct ForgetRow;
//!
//! impl OnZero<Index, Row> for ForgetRow {
//!     fn released(index: &Index, row: &Row) {
//!         index.forget(row);
//!     }
//! }
//!
//! let mut ward: Ward<Index, Row, ForgetRow> = Ward::new(index);
//! ward.add(row.clone(), 2); // 2
//! ward.sub(&row, 2);        // Some(0), ForgetRow::released runs
//! ```

use std::{hash::Hash, marker::PhantomData};

use rustc_hash::FxHashMap;

/// Cleanup selected at the type level. Implement it on a zero-sized tag.
pub trait OnZero<Ctx, K> {
    /// Called once when `key`'s count reaches zero. Runs synchronously inside
    /// [`Ward::sub`], so keep it short.
    fn released(ctx: &Ctx, key: &K);
}

/// Per-key counts that notify `T` when a key is released.
///
/// Not thread-safe; wrap it in a lock when shared.
#[derive(Debug, Clone)]
pub struct Ward<Ctx, K, T> {
    counts: FxHashMap<K, usize>,
    ctx: Ctx,
    _tag: PhantomData<T>,
}

impl<Ctx, K, T> Ward<Ctx, K, T>
where
    K: Eq + Hash,
    T: OnZero<Ctx, K>,
{
    const TAG_IS_ZST: () = assert!(size_of::<T>() == 0, "T must be zero-sized");

    /// Create an empty ward around `ctx`.
    pub fn new(ctx: Ctx) -> Self {
        let () = Self::TAG_IS_ZST;
        Self {
            counts: FxHashMap::default(),
            ctx,
            _tag: PhantomData,
        }
    }

    /// The shared cleanup context.
    pub fn ctx(&self) -> &Ctx {
        &self.ctx
    }

    /// Add `n` to `key`'s count and return the new count.
    ///
    /// Adding zero to an absent key does not create it.
    pub fn add(&mut self, key: K, n: usize) -> usize {
        if n == 0 {
            return self.count(&key);
        }
        let slot = self.counts.entry(key).or_insert(0);
        *slot += n;
        *slot
    }

    /// Subtract `n` from `key`'s count, saturating at zero.
    ///
    /// Reaching zero removes the key and fires [`OnZero::released`]. Returns `None` when the key
    /// was not counted.
    pub fn sub(&mut self, key: &K, n: usize) -> Option<usize> {
        let slot = self.counts.get_mut(key)?;
        *slot = slot.saturating_sub(n);
        if *slot > 0 {
            return Some(*slot);
        }
        self.counts.remove(key);
        T::released(&self.ctx, key);
        Some(0)
    }

    /// Current count of `key`, zero when absent.
    #[must_use]
    pub fn count(&self, key: &K) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Number of keys with a non-zero count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether no key is counted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
