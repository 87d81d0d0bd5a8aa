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

//! Per-row lock with owner, waiter and retired queues
//!
//! # Queues
//!
//! - **owners**: entries currently granted; all mutually compatible.
//! - **waiters**: blocked entries in arrival order, head = oldest.
//! - **retired**: entries whose transaction finished touching the row but has
//!   not committed. They keep conflicting under the base compatibility rule
//!   until released: a retired shared entry admits new shared requests but
//!   still blocks exclusive ones, a retired exclusive entry blocks everything.
//!
//! # Promotion
//!
//! After every release or retirement the waiter head is tested against owners
//! and retired entries; while it is compatible it moves to owners and its
//! transaction is woken. The first incompatible head ends the pass, so
//! waiters are always granted in arrival order.
//!
//! # Blocking
//!
//! Queue bookkeeping happens under a short per-row latch. A request that has
//! to wait is linked into the waiters queue under the latch, the latch is
//! dropped, and the caller parks on its own `TxnHandle`. Promotion and abort
//! both wake it there.

use std::fmt;
use std::sync::Arc;

use dotcc_common::{RowId, TxnHandle, TxnId, WaitOutcome};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::LockConfig;
use crate::error::{CcError, CcResult};
use crate::lock_manager::entry_pool::{EntryHandle, EntryList, EntryPool, PoolStats};
use crate::lock_manager::policy::{AlwaysWait, WaitDecision, WaitPolicy};

/// Lock mode of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock for reading
    Shared,
    /// Exclusive lock for writing
    Exclusive,
}

impl LockMode {
    /// Base compatibility rule: only shared/shared is compatible
    pub fn conflicts_with(self, other: LockMode) -> bool {
        !(self == LockMode::Shared && other == LockMode::Shared)
    }
}

/// Result of a lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The entry is an owner
    Granted,
    /// The entry is queued; complete with [`RowLock::wait`]
    Wait,
    /// The request was refused or the transaction was aborted while waiting
    Abort,
}

/// Queue an entry sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryQueue {
    Owners,
    Waiters,
    Retired,
}

/// Observable state of a transaction's entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryState {
    pub queue: EntryQueue,
    pub mode: LockMode,
    pub is_cohead: bool,
    /// Reached the owners queue through promotion rather than an immediate grant
    pub promoted: bool,
}

/// Statistics about one row lock
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowLockStatistics {
    pub owner_cnt: usize,
    pub waiter_cnt: usize,
    pub retired_cnt: usize,
    pub pool: PoolStats,
}

/// Queue state guarded by the row latch
#[derive(Debug)]
struct LockQueues {
    pool: EntryPool,
    owners: EntryList,
    waiters: EntryList,
    retired: EntryList,
}

impl LockQueues {
    fn new(capacity: usize) -> Self {
        Self {
            pool: EntryPool::with_capacity(capacity),
            owners: EntryList::new(),
            waiters: EntryList::new(),
            retired: EntryList::new(),
        }
    }

    fn list(&self, queue: EntryQueue) -> &EntryList {
        match queue {
            EntryQueue::Owners => &self.owners,
            EntryQueue::Waiters => &self.waiters,
            EntryQueue::Retired => &self.retired,
        }
    }

    /// Find the queue and slot holding `txn`'s entry
    fn locate(&self, txn: &Arc<TxnHandle>) -> Option<(EntryQueue, EntryHandle)> {
        [EntryQueue::Owners, EntryQueue::Retired, EntryQueue::Waiters]
            .into_iter()
            .find_map(|queue| self.list(queue).find(&self.pool, txn).map(|handle| (queue, handle)))
    }

    fn has_conflict(&self, list: &EntryList, mode: LockMode) -> bool {
        list.iter(&self.pool).any(|handle| self.pool.entry(handle).mode.conflicts_with(mode))
    }

    fn conflicts(&self, mode: LockMode, include_waiters: bool) -> bool {
        self.has_conflict(&self.owners, mode) || self.has_conflict(&self.retired, mode) || (include_waiters && self.has_conflict(&self.waiters, mode))
    }

    /// Transactions whose entries conflict with a request in `mode`
    fn blockers(&self, mode: LockMode, include_waiters: bool) -> Vec<Arc<TxnHandle>> {
        let mut lists = vec![&self.owners, &self.retired];
        if include_waiters {
            lists.push(&self.waiters);
        }
        lists
            .into_iter()
            .flat_map(|list| list.iter(&self.pool))
            .map(|handle| self.pool.entry(handle))
            .filter(|entry| entry.mode.conflicts_with(mode))
            .filter_map(|entry| entry.txn.clone())
            .collect()
    }

    fn list_mut(&mut self, queue: EntryQueue) -> (&mut EntryList, &mut EntryPool) {
        let list = match queue {
            EntryQueue::Owners => &mut self.owners,
            EntryQueue::Waiters => &mut self.waiters,
            EntryQueue::Retired => &mut self.retired,
        };
        (list, &mut self.pool)
    }

    /// Take a slot for `txn` and link it at the tail of `queue`
    fn link_new(&mut self, queue: EntryQueue, mode: LockMode, txn: Arc<TxnHandle>) -> EntryHandle {
        let handle = self.pool.get(mode, txn);
        let (list, pool) = self.list_mut(queue);
        list.push_back(pool, handle);
        handle
    }

    fn unlink(&mut self, queue: EntryQueue, handle: EntryHandle) {
        let (list, pool) = self.list_mut(queue);
        list.unlink(pool, handle);
    }

    fn move_entry(&mut self, from: EntryQueue, to: EntryQueue, handle: EntryHandle) {
        self.unlink(from, handle);
        let (list, pool) = self.list_mut(to);
        list.push_back(pool, handle);
    }

    /// Unlink an entry and hand its slot back to the pool
    fn remove(&mut self, queue: EntryQueue, handle: EntryHandle) {
        self.unlink(queue, handle);
        self.pool.put(handle);
    }

    /// Move compatible waiters to owners, head first; returns how many moved
    fn promote_waiters(&mut self) -> usize {
        let mut promoted = 0;
        while let Some(head) = self.waiters.head() {
            let mode = self.pool.entry(head).mode;
            if self.has_conflict(&self.owners, mode) || self.has_conflict(&self.retired, mode) {
                break;
            }

            self.move_entry(EntryQueue::Waiters, EntryQueue::Owners, head);

            let entry = self.pool.entry_mut(head);
            entry.dirty = true;
            if let Some(txn) = &entry.txn {
                trace!(txn = %txn.id(), ?mode, "waiter promoted");
                txn.grant();
            }
            promoted += 1;
        }
        promoted
    }

    /// Recompute co-head flags over retired entries followed by owners.
    ///
    /// Shared entries are co-heads while no exclusive entry precedes them; an
    /// exclusive entry only when nothing precedes it.
    fn update_coheads(&mut self) {
        let mut seen_any = false;
        let mut seen_exclusive = false;
        for list in [self.retired, self.owners] {
            let mut cursor = list.head();
            while let Some(handle) = cursor {
                let entry = self.pool.entry_mut(handle);
                entry.is_cohead = match entry.mode {
                    LockMode::Shared => !seen_exclusive,
                    LockMode::Exclusive => !seen_any,
                };
                seen_any = true;
                seen_exclusive |= entry.mode == LockMode::Exclusive;
                cursor = self.pool.next_in_list(handle);
            }
        }
    }

    fn ids(&self, queue: EntryQueue) -> Vec<TxnId> {
        self.list(queue)
            .iter(&self.pool)
            .filter_map(|handle| self.pool.entry(handle).txn.as_ref().map(|txn| txn.id()))
            .collect()
    }
}

/// Shared/exclusive lock of a single row
pub struct RowLock {
    row_id: RowId,
    /// Row latch; held only for queue bookkeeping
    queues: Mutex<LockQueues>,
    /// Deadlock-avoidance policy consulted on conflict
    policy: Arc<dyn WaitPolicy>,
    /// Compatible newcomers queue behind existing waiters
    queue_behind_waiters: bool,
}

impl fmt::Debug for RowLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues = self.queues.lock();
        f.debug_struct("RowLock")
            .field("row_id", &self.row_id)
            .field("owners", &queues.ids(EntryQueue::Owners))
            .field("waiters", &queues.ids(EntryQueue::Waiters))
            .field("retired", &queues.ids(EntryQueue::Retired))
            .finish()
    }
}

impl RowLock {
    /// Create a row lock with default settings and the [`AlwaysWait`] policy
    pub fn new(row_id: RowId) -> Self {
        Self::with_config(row_id, &LockConfig::default(), Arc::new(AlwaysWait))
    }

    pub fn with_config(row_id: RowId, config: &LockConfig, policy: Arc<dyn WaitPolicy>) -> Self {
        Self {
            row_id,
            queues: Mutex::new(LockQueues::new(config.initial_pool_capacity)),
            policy,
            queue_behind_waiters: config.queue_behind_waiters,
        }
    }

    pub fn row_id(&self) -> RowId {
        self.row_id
    }

    /// Request the lock without blocking.
    ///
    /// Returns `Granted` if the entry went straight to owners, `Wait` if it was
    /// queued (finish with [`RowLock::wait`]), or `Abort` if the policy refused
    /// to queue it or the transaction is already being aborted.
    pub fn request(&self, mode: LockMode, txn: &Arc<TxnHandle>) -> CcResult<LockOutcome> {
        self.request_inner(mode, txn, None)
    }

    /// Like [`RowLock::request`], also reporting who blocks the request.
    ///
    /// On `Wait` or a policy `Abort`, `blockers` holds the ids of every owner,
    /// retired entry (and, when newcomers queue behind waiters, earlier waiter)
    /// that conflicts with the request. It is cleared otherwise.
    pub fn request_with_blockers(&self, mode: LockMode, txn: &Arc<TxnHandle>, blockers: &mut Vec<TxnId>) -> CcResult<LockOutcome> {
        blockers.clear();
        self.request_inner(mode, txn, Some(blockers))
    }

    fn request_inner(&self, mode: LockMode, txn: &Arc<TxnHandle>, blockers: Option<&mut Vec<TxnId>>) -> CcResult<LockOutcome> {
        if txn.is_abort_requested() {
            trace!(row = %self.row_id, txn = %txn.id(), "request from aborting transaction");
            return Ok(LockOutcome::Abort);
        }

        let mut queues = self.queues.lock();
        if queues.locate(txn).is_some() {
            return Err(CcError::DuplicateRequest(txn.id()));
        }

        if !queues.conflicts(mode, self.queue_behind_waiters) {
            queues.link_new(EntryQueue::Owners, mode, txn.clone());
            queues.update_coheads();
            trace!(row = %self.row_id, txn = %txn.id(), ?mode, "lock granted");
            return Ok(LockOutcome::Granted);
        }

        let conflicting = queues.blockers(mode, self.queue_behind_waiters);
        if let Some(blockers) = blockers {
            blockers.extend(conflicting.iter().map(|blocker| blocker.id()));
        }

        match self.policy.on_conflict(txn, &conflicting) {
            WaitDecision::Abort => {
                debug!(row = %self.row_id, txn = %txn.id(), ?mode, blockers = conflicting.len(), "lock refused by wait policy");
                Ok(LockOutcome::Abort)
            }
            WaitDecision::Wait => {
                queues.link_new(EntryQueue::Waiters, mode, txn.clone());
                txn.prepare_wait();
                debug!(row = %self.row_id, txn = %txn.id(), ?mode, blockers = conflicting.len(), "lock request queued");
                Ok(LockOutcome::Wait)
            }
        }
    }

    /// Block until a queued request is promoted or its transaction is aborted.
    ///
    /// On abort the waiting entry is removed and `Abort` is returned. A parked
    /// waiter whose entry another thread removed with [`RowLock::release`] also
    /// returns `Abort`. If the promotion won the race against the abort the
    /// entry stays an owner and `Granted` is returned; the caller releases it
    /// on its abort path.
    pub fn wait(&self, txn: &Arc<TxnHandle>) -> CcResult<LockOutcome> {
        if self.queues.lock().locate(txn).is_none() {
            return Err(CcError::NotWaiting(txn.id()));
        }
        Ok(self.park(txn))
    }

    /// Wait out a request queued by this caller; a missing entry was withdrawn
    fn park(&self, txn: &Arc<TxnHandle>) -> LockOutcome {
        let located = self.queues.lock().locate(txn);
        match located {
            Some((EntryQueue::Waiters, _)) => {}
            Some(_) => {
                txn.cancel_wait();
                return LockOutcome::Granted;
            }
            None => {
                txn.cancel_wait();
                return LockOutcome::Abort;
            }
        }

        match txn.wait_for_grant() {
            WaitOutcome::Granted => LockOutcome::Granted,
            WaitOutcome::Aborted | WaitOutcome::Withdrawn => self.withdraw(txn),
        }
    }

    /// Remove an aborted waiter, unless promotion got there first
    fn withdraw(&self, txn: &Arc<TxnHandle>) -> LockOutcome {
        let mut queues = self.queues.lock();
        let outcome = match queues.locate(txn) {
            Some((EntryQueue::Waiters, handle)) => {
                queues.remove(EntryQueue::Waiters, handle);
                let promoted = queues.promote_waiters();
                queues.update_coheads();
                debug!(row = %self.row_id, txn = %txn.id(), promoted, "aborted while waiting");
                LockOutcome::Abort
            }
            Some(_) => LockOutcome::Granted,
            None => LockOutcome::Abort,
        };
        txn.cancel_wait();
        outcome
    }

    /// Acquire the lock, blocking while incompatible.
    ///
    /// Returns `Granted` or `Abort`.
    pub fn acquire(&self, mode: LockMode, txn: &Arc<TxnHandle>) -> CcResult<LockOutcome> {
        match self.request(mode, txn)? {
            LockOutcome::Wait => Ok(self.park(txn)),
            outcome => Ok(outcome),
        }
    }

    /// Acquire the lock, blocking while incompatible, and report blockers.
    ///
    /// When the request has to wait, `on_block` receives the blocking ids after
    /// the row latch is released and before the caller parks. A deadlock
    /// detector can record the wait-for edges there and abort a victim; if the
    /// victim is this transaction the call returns `Abort`.
    pub fn acquire_reporting<F>(&self, mode: LockMode, txn: &Arc<TxnHandle>, on_block: F) -> CcResult<LockOutcome>
    where
        F: FnOnce(&[TxnId]),
    {
        let mut blockers = Vec::new();
        match self.request_with_blockers(mode, txn, &mut blockers)? {
            LockOutcome::Wait => {
                on_block(&blockers);
                Ok(self.park(txn))
            }
            outcome => Ok(outcome),
        }
    }

    /// Drop `txn`'s entry from whichever queue holds it.
    ///
    /// Releasing a waiter is the abort-while-blocked path; releasing an owner
    /// or retired entry completes a commit or abort. Waiters that become
    /// compatible are promoted in arrival order.
    pub fn release(&self, txn: &Arc<TxnHandle>) -> CcResult<EntryQueue> {
        let mut queues = self.queues.lock();
        let (queue, handle) = queues.locate(txn).ok_or(CcError::NotHeld(txn.id()))?;

        queues.remove(queue, handle);
        if queue == EntryQueue::Waiters {
            txn.cancel_wait();
        }
        let promoted = queues.promote_waiters();
        queues.update_coheads();

        trace!(row = %self.row_id, txn = %txn.id(), ?queue, promoted, "lock released");
        Ok(queue)
    }

    /// Move `txn`'s owner entry to the retired queue.
    ///
    /// A retired shared entry stops blocking new shared requests; exclusive
    /// requests stay blocked until [`RowLock::release`]. Retiring twice is a
    /// no-op.
    pub fn retire(&self, txn: &Arc<TxnHandle>) -> CcResult<()> {
        let mut queues = self.queues.lock();
        match queues.locate(txn) {
            Some((EntryQueue::Owners, handle)) => {
                queues.move_entry(EntryQueue::Owners, EntryQueue::Retired, handle);
                let promoted = queues.promote_waiters();
                queues.update_coheads();
                debug!(row = %self.row_id, txn = %txn.id(), promoted, "lock retired");
                Ok(())
            }
            Some((EntryQueue::Retired, _)) => Ok(()),
            _ => Err(CcError::NotOwner(txn.id())),
        }
    }

    pub fn owner_count(&self) -> usize {
        self.queues.lock().owners.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.queues.lock().waiters.len()
    }

    pub fn retired_count(&self) -> usize {
        self.queues.lock().retired.len()
    }

    /// Owner ids with their modes, oldest grant first
    pub fn holders(&self) -> Vec<(TxnId, LockMode)> {
        let queues = self.queues.lock();
        queues
            .owners
            .iter(&queues.pool)
            .map(|handle| queues.pool.entry(handle))
            .filter_map(|entry| entry.txn.as_ref().map(|txn| (txn.id(), entry.mode)))
            .collect()
    }

    /// Waiter ids, oldest first
    pub fn waiting(&self) -> Vec<TxnId> {
        self.queues.lock().ids(EntryQueue::Waiters)
    }

    /// Retired ids, oldest first
    pub fn retired(&self) -> Vec<TxnId> {
        self.queues.lock().ids(EntryQueue::Retired)
    }

    pub fn entry_state(&self, txn: &Arc<TxnHandle>) -> Option<EntryState> {
        let queues = self.queues.lock();
        queues.locate(txn).map(|(queue, handle)| {
            let entry = queues.pool.entry(handle);
            EntryState {
                queue,
                mode: entry.mode,
                is_cohead: entry.is_cohead,
                promoted: entry.dirty,
            }
        })
    }

    pub fn is_cohead(&self, txn: &Arc<TxnHandle>) -> Option<bool> {
        self.entry_state(txn).map(|state| state.is_cohead)
    }

    pub fn get_statistics(&self) -> RowLockStatistics {
        let queues = self.queues.lock();
        RowLockStatistics {
            owner_cnt: queues.owners.len(),
            waiter_cnt: queues.waiters.len(),
            retired_cnt: queues.retired.len(),
            pool: queues.pool.get_statistics(),
        }
    }
}
