// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Pooled lock entries and the intrusive queues built over them
//!
//! Every row lock owns one [`EntryPool`]: an arena of [`LockEntry`] slots
//! addressed by [`EntryHandle`] indices plus a free list. Queue links are
//! stored as handles, so the owners/waiters/retired queues are index-linked
//! lists living entirely inside the arena. A request takes a slot from the
//! free list and gives it back on removal; the arena only grows when every
//! slot is in use.

use std::sync::Arc;

use dotcc_common::TxnHandle;

use crate::lock_manager::row_lock::LockMode;

/// Stable index of an entry inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(u32);

impl EntryHandle {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One lock request on a row
#[derive(Debug)]
pub struct LockEntry {
    /// Requested mode
    pub mode: LockMode,
    /// Compatible with every entry ahead of it in retired-then-owners order
    pub is_cohead: bool,
    /// Co-head flag flipped on and the transaction has not looked yet
    pub dirty: bool,
    /// Requesting transaction; `None` while the slot is free
    pub txn: Option<Arc<TxnHandle>>,
    prev: Option<EntryHandle>,
    next: Option<EntryHandle>,
}

impl LockEntry {
    fn vacant() -> Self {
        Self {
            mode: LockMode::Shared,
            is_cohead: false,
            dirty: false,
            txn: None,
            prev: None,
            next: None,
        }
    }

    /// Whether this entry belongs to `txn` (reference identity)
    pub fn belongs_to(&self, txn: &Arc<TxnHandle>) -> bool {
        self.txn.as_ref().is_some_and(|owner| Arc::ptr_eq(owner, txn))
    }
}

/// Statistics about entry pool usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,    // Slots in the arena
    pub in_use: usize,      // Slots linked into some queue
    pub peak_usage: usize,  // Maximum slots in use at once
    pub allocations: u64,   // Total get operations
    pub reuses: u64,        // Gets served from the free list
    pub grows: u64,         // Gets that had to extend the arena
}

/// Arena of lock entries with a free list
#[derive(Debug)]
pub struct EntryPool {
    entries: Vec<LockEntry>,
    free: Vec<EntryHandle>,
    stats: PoolStats,
}

impl EntryPool {
    /// Create a pool with `capacity` preallocated free slots
    pub fn with_capacity(capacity: usize) -> Self {
        let mut pool = Self {
            entries: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            stats: PoolStats::default(),
        };
        for _ in 0..capacity {
            let handle = pool.push_slot();
            pool.free.push(handle);
        }
        // Hand out low indices first
        pool.free.reverse();
        pool
    }

    fn push_slot(&mut self) -> EntryHandle {
        let handle = EntryHandle(u32::try_from(self.entries.len()).expect("entry pool exceeds u32::MAX slots"));
        self.entries.push(LockEntry::vacant());
        self.stats.capacity = self.entries.len();
        handle
    }

    /// Take a slot and initialise it for a new request
    pub fn get(&mut self, mode: LockMode, txn: Arc<TxnHandle>) -> EntryHandle {
        let handle = match self.free.pop() {
            Some(handle) => {
                self.stats.reuses += 1;
                handle
            }
            None => {
                self.stats.grows += 1;
                self.push_slot()
            }
        };

        let entry = &mut self.entries[handle.index()];
        entry.mode = mode;
        entry.is_cohead = false;
        entry.dirty = false;
        entry.txn = Some(txn);
        entry.prev = None;
        entry.next = None;

        self.stats.allocations += 1;
        self.stats.in_use += 1;
        self.stats.peak_usage = self.stats.peak_usage.max(self.stats.in_use);
        handle
    }

    /// Return a detached slot to the free list
    pub fn put(&mut self, handle: EntryHandle) {
        let entry = &mut self.entries[handle.index()];
        debug_assert!(entry.txn.is_some(), "entry returned twice");
        debug_assert!(entry.prev.is_none() && entry.next.is_none(), "entry returned while linked");
        entry.txn = None;
        self.free.push(handle);
        self.stats.in_use -= 1;
    }

    pub fn entry(&self, handle: EntryHandle) -> &LockEntry {
        &self.entries[handle.index()]
    }

    pub fn entry_mut(&mut self, handle: EntryHandle) -> &mut LockEntry {
        &mut self.entries[handle.index()]
    }

    /// Successor of a linked entry in its queue
    pub fn next_in_list(&self, handle: EntryHandle) -> Option<EntryHandle> {
        self.entries[handle.index()].next
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn get_statistics(&self) -> PoolStats {
        self.stats.clone()
    }
}

/// Index-linked queue of pool entries.
///
/// Head is the oldest entry, tail the youngest.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntryList {
    head: Option<EntryHandle>,
    tail: Option<EntryHandle>,
    len: usize,
}

impl EntryList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<EntryHandle> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Link a detached entry at the tail
    pub fn push_back(&mut self, pool: &mut EntryPool, handle: EntryHandle) {
        {
            let entry = pool.entry_mut(handle);
            entry.prev = self.tail;
            entry.next = None;
        }
        match self.tail {
            Some(tail) => pool.entry_mut(tail).next = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        self.len += 1;
    }

    /// Unlink an entry that is on this list, leaving it detached
    pub fn unlink(&mut self, pool: &mut EntryPool, handle: EntryHandle) {
        let (prev, next) = {
            let entry = pool.entry_mut(handle);
            let links = (entry.prev, entry.next);
            entry.prev = None;
            entry.next = None;
            links
        };
        match prev {
            Some(prev) => pool.entry_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => pool.entry_mut(next).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Find the entry belonging to `txn`
    pub fn find(&self, pool: &EntryPool, txn: &Arc<TxnHandle>) -> Option<EntryHandle> {
        self.iter(pool).find(|&handle| pool.entry(handle).belongs_to(txn))
    }

    /// Iterate handles from head to tail
    pub fn iter<'a>(&self, pool: &'a EntryPool) -> ListIter<'a> {
        ListIter { pool, cursor: self.head }
    }
}

/// Iterator over the handles of an [`EntryList`]
pub struct ListIter<'a> {
    pool: &'a EntryPool,
    cursor: Option<EntryHandle>,
}

impl Iterator for ListIter<'_> {
    type Item = EntryHandle;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cursor?;
        self.cursor = self.pool.entry(current).next;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: u64) -> Arc<TxnHandle> {
        TxnHandle::shared(id)
    }

    fn ids(list: &EntryList, pool: &EntryPool) -> Vec<u64> {
        list.iter(pool).map(|h| pool.entry(h).txn.as_ref().unwrap().id().0).collect()
    }

    #[test]
    fn test_pool_reuses_slots() {
        let mut pool = EntryPool::with_capacity(2);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.free_count(), 2);

        let a = pool.get(LockMode::Shared, txn(1));
        let b = pool.get(LockMode::Exclusive, txn(2));
        assert_eq!(pool.free_count(), 0);

        pool.put(a);
        let c = pool.get(LockMode::Shared, txn(3));
        assert_eq!(c, a);
        assert_eq!(pool.capacity(), 2);

        let stats = pool.get_statistics();
        assert_eq!(stats.allocations, 3);
        assert_eq!(stats.reuses, 3);
        assert_eq!(stats.grows, 0);
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.peak_usage, 2);

        pool.put(b);
        pool.put(c);
        assert_eq!(pool.get_statistics().in_use, 0);
    }

    #[test]
    fn test_pool_grows_when_exhausted() {
        let mut pool = EntryPool::with_capacity(0);
        let a = pool.get(LockMode::Shared, txn(1));
        let b = pool.get(LockMode::Shared, txn(2));
        assert_ne!(a, b);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.get_statistics().grows, 2);
    }

    #[test]
    fn test_put_clears_transaction() {
        let mut pool = EntryPool::with_capacity(1);
        let t = txn(1);
        let h = pool.get(LockMode::Exclusive, t.clone());
        assert!(pool.entry(h).belongs_to(&t));
        assert_eq!(Arc::strong_count(&t), 2);

        pool.put(h);
        assert!(pool.entry(h).txn.is_none());
        assert_eq!(Arc::strong_count(&t), 1);
    }

    #[test]
    fn test_list_push_and_unlink() {
        let mut pool = EntryPool::with_capacity(4);
        let mut list = EntryList::new();
        let handles: Vec<_> = (1..=4).map(|i| pool.get(LockMode::Shared, txn(i))).collect();
        for &h in &handles {
            list.push_back(&mut pool, h);
        }
        assert_eq!(ids(&list, &pool), vec![1, 2, 3, 4]);
        assert_eq!(list.len(), 4);

        // middle, head, tail
        list.unlink(&mut pool, handles[1]);
        assert_eq!(ids(&list, &pool), vec![1, 3, 4]);
        list.unlink(&mut pool, handles[0]);
        assert_eq!(ids(&list, &pool), vec![3, 4]);
        list.unlink(&mut pool, handles[3]);
        assert_eq!(ids(&list, &pool), vec![3]);
        assert_eq!(list.head(), Some(handles[2]));

        list.unlink(&mut pool, handles[2]);
        assert!(list.is_empty());
        assert_eq!(list.head(), None);

        // relinking after full drain keeps order
        list.push_back(&mut pool, handles[3]);
        list.push_back(&mut pool, handles[0]);
        assert_eq!(ids(&list, &pool), vec![4, 1]);
    }

    #[test]
    fn test_list_find_by_reference() {
        let mut pool = EntryPool::with_capacity(2);
        let mut list = EntryList::new();
        let t1 = txn(1);
        let twin = txn(1);
        let h = pool.get(LockMode::Shared, t1.clone());
        list.push_back(&mut pool, h);

        assert_eq!(list.find(&pool, &t1), Some(h));
        assert_eq!(list.find(&pool, &twin), None);
    }
}
