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

//! Transaction handle
//!
//! A [`TxnHandle`] is the only thing the row-level CC objects know about a
//! transaction. Lock entries and waiters hold it by `Arc` and compare it by
//! reference, so two handles with the same id are still distinct requesters.
//!
//! The handle also carries the wait slot used by the lock manager: a blocked
//! caller parks on its own handle, never on a row, and is woken either by a
//! promotion (`grant`) or by an external abort decision (`request_abort`).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::types::{Priority, TxnId};

/// State of a transaction's wait slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    /// Not queued anywhere
    Idle,
    /// Queued as a waiter on some row
    Waiting,
    /// Promoted, wake-up not consumed yet
    Granted,
}

/// How a blocked wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The waiting entry was promoted to owner
    Granted,
    /// An abort was requested while waiting
    Aborted,
    /// The waiting entry was removed by another thread
    Withdrawn,
}

/// Per-transaction parking slot
#[derive(Debug)]
struct WaitSlot {
    state: Mutex<WaitState>,
    cond: Condvar,
}

/// Handle of a running transaction as seen by the CC kernel
#[derive(Debug)]
pub struct TxnHandle {
    /// Transaction identifier, reported to deadlock detectors
    id: TxnId,
    /// Start timestamp; smaller means older
    start_ts: u64,
    /// Current priority level
    priority: AtomicU8,
    /// Number of times this transaction has been aborted and retried
    abort_count: AtomicU32,
    /// Set by an external detector or by the owner to cancel the attempt
    abort_requested: AtomicBool,
    wait: WaitSlot,
}

impl TxnHandle {
    /// Create a new handle
    pub fn new(id: TxnId, start_ts: u64, priority: Priority) -> Self {
        Self {
            id,
            start_ts,
            priority: AtomicU8::new(priority.level()),
            abort_count: AtomicU32::new(0),
            abort_requested: AtomicBool::new(false),
            wait: WaitSlot {
                state: Mutex::new(WaitState::Idle),
                cond: Condvar::new(),
            },
        }
    }

    /// Create a shared handle at the lowest priority, using the id as timestamp
    pub fn shared(id: u64) -> Arc<Self> {
        Arc::new(Self::new(TxnId(id), id, Priority::LOWEST))
    }

    /// Create a shared handle at the given priority, using the id as timestamp
    pub fn with_priority(id: u64, priority: Priority) -> Arc<Self> {
        Arc::new(Self::new(TxnId(id), id, priority))
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn start_timestamp(&self) -> u64 {
        self.start_ts
    }

    pub fn priority(&self) -> Priority {
        Priority::saturating(self.priority.load(Ordering::Relaxed))
    }

    /// Change the priority used by subsequent requests
    pub fn set_priority(&self, priority: Priority) {
        self.priority.store(priority.level(), Ordering::Relaxed);
    }

    pub fn abort_count(&self) -> u32 {
        self.abort_count.load(Ordering::Relaxed)
    }

    /// Count one more abort of this transaction and return the new total
    pub fn record_abort(&self) -> u32 {
        self.abort_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reference identity, the way CC queues compare requesters
    pub fn is_same(self: &Arc<Self>, other: &Arc<Self>) -> bool {
        Arc::ptr_eq(self, other)
    }

    /// Ask the transaction to abort.
    ///
    /// A transaction parked in [`TxnHandle::wait_for_grant`] wakes up with
    /// [`WaitOutcome::Aborted`]; later lock requests fail fast.
    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
        let _state = self.wait.state.lock();
        self.wait.cond.notify_all();
        debug!(txn = %self.id, "abort requested");
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    /// Reset the attempt state before the transaction is retried
    pub fn begin_attempt(&self) {
        self.abort_requested.store(false, Ordering::Release);
        *self.wait.state.lock() = WaitState::Idle;
    }

    /// Mark the handle as queued. Called by a lock manager with its row latch held.
    pub fn prepare_wait(&self) {
        *self.wait.state.lock() = WaitState::Waiting;
    }

    /// Wake the handle after promotion. Called by a lock manager with its row latch held.
    pub fn grant(&self) {
        let mut state = self.wait.state.lock();
        *state = WaitState::Granted;
        self.wait.cond.notify_all();
    }

    /// Return the slot to idle after the waiting entry was removed.
    ///
    /// A thread still parked on the slot wakes with [`WaitOutcome::Withdrawn`].
    pub fn cancel_wait(&self) {
        let mut state = self.wait.state.lock();
        *state = WaitState::Idle;
        self.wait.cond.notify_all();
    }

    /// Whether the handle is currently parked or about to park
    pub fn is_waiting(&self) -> bool {
        *self.wait.state.lock() == WaitState::Waiting
    }

    /// Block until promoted, aborted, or withdrawn from the queue.
    ///
    /// A grant that raced an abort request wins: the entry is already an
    /// owner and the abort path must release it like any other held lock.
    pub fn wait_for_grant(&self) -> WaitOutcome {
        let mut state = self.wait.state.lock();
        loop {
            if let Some(outcome) = self.take_outcome(&mut state) {
                return outcome;
            }
            self.wait.cond.wait(&mut state);
        }
    }

    /// Like [`TxnHandle::wait_for_grant`], giving up after `timeout`.
    ///
    /// Returns `None` if the slot is still waiting when the time is up; the
    /// transaction is then still queued.
    pub fn wait_for_grant_timeout(&self, timeout: Duration) -> Option<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.wait.state.lock();
        loop {
            if let Some(outcome) = self.take_outcome(&mut state) {
                return Some(outcome);
            }
            if self.wait.cond.wait_until(&mut state, deadline).timed_out() {
                return self.take_outcome(&mut state);
            }
        }
    }

    fn take_outcome(&self, state: &mut WaitState) -> Option<WaitOutcome> {
        match *state {
            WaitState::Granted => {
                *state = WaitState::Idle;
                Some(WaitOutcome::Granted)
            }
            WaitState::Waiting if self.is_abort_requested() => Some(WaitOutcome::Aborted),
            WaitState::Waiting => None,
            // entry already withdrawn
            WaitState::Idle if self.is_abort_requested() => Some(WaitOutcome::Aborted),
            WaitState::Idle => Some(WaitOutcome::Withdrawn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_handle_identity() {
        let a = TxnHandle::shared(1);
        let b = TxnHandle::shared(1);
        assert_eq!(a.id(), b.id());
        assert!(a.is_same(&a.clone()));
        assert!(!a.is_same(&b));
    }

    #[test]
    fn test_priority_and_abort_counters() {
        let txn = TxnHandle::with_priority(3, Priority::saturating(2));
        assert_eq!(txn.priority(), Priority::saturating(2));
        txn.set_priority(Priority::HIGHEST);
        assert_eq!(txn.priority(), Priority::HIGHEST);

        assert_eq!(txn.abort_count(), 0);
        assert_eq!(txn.record_abort(), 1);
        assert_eq!(txn.record_abort(), 2);
        assert_eq!(txn.start_timestamp(), 3);
    }

    #[test]
    fn test_grant_before_wait_is_not_lost() {
        let txn = TxnHandle::shared(1);
        txn.prepare_wait();
        assert!(txn.is_waiting());
        txn.grant();
        assert_eq!(txn.wait_for_grant(), WaitOutcome::Granted);
        assert!(!txn.is_waiting());
    }

    #[test]
    fn test_grant_wakes_parked_thread() {
        let txn = TxnHandle::shared(1);
        txn.prepare_wait();

        let waiter = {
            let txn = txn.clone();
            thread::spawn(move || txn.wait_for_grant())
        };

        thread::sleep(Duration::from_millis(10));
        txn.grant();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Granted);
    }

    #[test]
    fn test_abort_wakes_parked_thread() {
        let txn = TxnHandle::shared(1);
        txn.prepare_wait();

        let waiter = {
            let txn = txn.clone();
            thread::spawn(move || txn.wait_for_grant())
        };

        thread::sleep(Duration::from_millis(10));
        txn.request_abort();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Aborted);
        assert!(txn.is_abort_requested());

        txn.begin_attempt();
        assert!(!txn.is_abort_requested());
    }

    #[test]
    fn test_grant_wins_over_late_abort() {
        let txn = TxnHandle::shared(1);
        txn.prepare_wait();
        txn.grant();
        txn.request_abort();
        assert_eq!(txn.wait_for_grant(), WaitOutcome::Granted);
    }

    #[test]
    fn test_cancel_wakes_parked_thread() {
        let txn = TxnHandle::shared(1);
        txn.prepare_wait();

        let waiter = {
            let txn = txn.clone();
            thread::spawn(move || txn.wait_for_grant())
        };

        thread::sleep(Duration::from_millis(10));
        txn.cancel_wait();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Withdrawn);
        assert!(!txn.is_waiting());
    }

    #[test]
    fn test_cancel_before_wait_is_not_lost() {
        let txn = TxnHandle::shared(1);
        txn.prepare_wait();
        txn.cancel_wait();
        assert_eq!(txn.wait_for_grant_timeout(Duration::from_millis(5)), Some(WaitOutcome::Withdrawn));
    }

    #[test]
    fn test_wait_timeout() {
        let txn = TxnHandle::shared(1);
        txn.prepare_wait();
        assert_eq!(txn.wait_for_grant_timeout(Duration::from_millis(5)), None);
        txn.grant();
        assert_eq!(txn.wait_for_grant_timeout(Duration::from_millis(5)), Some(WaitOutcome::Granted));
    }
}
