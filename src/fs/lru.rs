//! LRU order for dentries with zero references.
//!
//! Entries are keyed by dentry id in insertion order: the back of the map is
//! the most recently cached dentry, the front is the next eviction victim.
//! The structure itself is mutated only under the filesystem rename lock;
//! it enforces no policy of its own beyond ordering.

use std::sync::Arc;

use hashlink::LinkedHashMap;

use crate::fs::dentry::Dentry;

#[derive(Default)]
pub(crate) struct DentryLru {
    entries: LinkedHashMap<u64, Arc<Dentry>>,
}

impl DentryLru {
    pub fn new() -> Self {
        Self {
            entries: LinkedHashMap::new(),
        }
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Insert a dentry at the most-recently-used position.
    pub fn push_mru(&mut self, dentry: Arc<Dentry>) {
        let prev = self.entries.insert(dentry.id(), dentry);
        debug_assert!(prev.is_none(), "dentry was already in the LRU");
    }

    /// Move an existing entry to the most-recently-used position.
    pub fn touch(&mut self, id: u64) {
        if let Some(entry) = self.entries.remove(&id) {
            self.entries.insert(id, entry);
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<Arc<Dentry>> {
        self.entries.remove(&id)
    }

    /// Take the least-recently-used entry.
    pub fn pop_lru(&mut self) -> Option<Arc<Dentry>> {
        self.entries.pop_front().map(|(_, dentry)| dentry)
    }

    /// Drop every entry, releasing the LRU's references.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
