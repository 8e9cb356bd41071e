//! Directory entry index.
//!
//! Dirents live in one arena and are reachable through two ordered indexes, by name for lookup
//! and by cookie for resumable listing. Both indexes always hold exactly the arena's slots.

use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    ops::Bound,
};

use rustc_hash::FxHashMap;

use super::key::HandleKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Slot(u64);

/// One name in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    /// Name within the parent.
    pub name: OsString,
    /// Listing cookie, unique within the parent.
    pub cookie: u64,
    /// Cache key of the named object.
    pub child: HandleKey,
}

/// The dirents of one cached directory.
#[derive(Debug, Default)]
pub struct DirIndex {
    arena: FxHashMap<Slot, Dirent>,
    by_name: BTreeMap<OsString, Slot>,
    by_cookie: BTreeMap<u64, Slot>,
    next_slot: u64,
    active_children: usize,
}

impl DirIndex {
    /// Add a dirent. Fails when the name or the cookie is already taken.
    pub fn insert(&mut self, dirent: Dirent) -> Result<(), Dirent> {
        if self.by_name.contains_key(&dirent.name) || self.by_cookie.contains_key(&dirent.cookie) {
            return Err(dirent);
        }
        let slot = Slot(self.next_slot);
        self.next_slot += 1;
        self.by_name.insert(dirent.name.clone(), slot);
        self.by_cookie.insert(dirent.cookie, slot);
        self.arena.insert(slot, dirent);
        self.active_children += 1;
        Ok(())
    }

    /// Remove the dirent called `name`.
    pub fn remove_by_name(&mut self, name: &OsStr) -> Option<Dirent> {
        let slot = self.by_name.remove(name)?;
        let dirent = self.arena.remove(&slot)?;
        self.by_cookie.remove(&dirent.cookie);
        self.active_children -= 1;
        Some(dirent)
    }

    /// Remove the dirent with `cookie`.
    pub fn remove_by_cookie(&mut self, cookie: u64) -> Option<Dirent> {
        let slot = self.by_cookie.remove(&cookie)?;
        let dirent = self.arena.remove(&slot)?;
        self.by_name.remove(&dirent.name);
        self.active_children -= 1;
        Some(dirent)
    }

    /// Dirent called `name`.
    #[must_use]
    pub fn get(&self, name: &OsStr) -> Option<&Dirent> {
        self.by_name.get(name).and_then(|slot| self.arena.get(slot))
    }

    /// Dirent with `cookie`.
    #[must_use]
    pub fn get_by_cookie(&self, cookie: u64) -> Option<&Dirent> {
        self.by_cookie.get(&cookie).and_then(|slot| self.arena.get(slot))
    }

    /// Dirents with a cookie strictly greater than `after`, in cookie order.
    pub fn after_cookie(&self, after: u64) -> impl Iterator<Item = &Dirent> {
        self.by_cookie
            .range((Bound::Excluded(after), Bound::Unbounded))
            .filter_map(|(_, slot)| self.arena.get(slot))
    }

    /// All dirents in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Dirent> {
        self.by_name.values().filter_map(|slot| self.arena.get(slot))
    }

    /// Number of live children.
    #[must_use]
    pub fn active_children(&self) -> usize {
        self.active_children
    }

    /// Whether the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active_children == 0
    }
}
