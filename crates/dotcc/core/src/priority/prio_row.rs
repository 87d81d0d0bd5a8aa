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
//! Priority-preemptive optimistic CC state of one row
//!
//! Readers take a snapshot and, unless configured otherwise, a reservation at
//! their priority. Writers latch the word at commit time; a writer whose
//! priority is below the reserved one is refused instead of blocking, so a
//! high-priority transaction is never delayed by the commit of a lower one.
//!
//! Every access to the word is `Relaxed`. Row content lives behind its own
//! `RwLock`; a snapshot is only handed out when the word observed before the
//! copy is still current afterwards.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};
use dotcc_common::{Priority, TxnHandle};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::config::PriorityConfig;
use crate::error::{CcError, CcResult};
use crate::priority::tid_word::{LATCH_BIT, Reservation, ReserveOutcome, TidWord};

/// Result of a latch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Done,
    /// Another writer holds the latch
    Taken,
    /// A higher priority is reserved on the row
    PriorityConflict,
}

/// Copy of the row content and the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<D> {
    pub data: D,
    pub version: u64,
}

/// A snapshot plus the reservation taken with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access<D> {
    pub snapshot: Snapshot<D>,
    pub reserve: ReserveOutcome,
}

impl<D> Access<D> {
    pub fn reservation(&self) -> Option<Reservation> {
        self.reserve.reservation()
    }
}

pub struct PrioRow<D> {
    word: CachePadded<AtomicU64>,
    data: RwLock<D>,
    skip_lowest_reservation: bool,
}

impl<D: fmt::Debug> fmt::Debug for PrioRow<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrioRow").field("word", &self.word()).field("data", &*self.data.read()).finish()
    }
}

impl<D> PrioRow<D> {
    /// Create a row at data version zero
    pub fn new(data: D) -> Self {
        Self::with_config(data, &PriorityConfig::default())
    }

    pub fn with_config(data: D, config: &PriorityConfig) -> Self {
        Self {
            word: CachePadded::new(AtomicU64::new(TidWord::default().raw())),
            data: RwLock::new(data),
            skip_lowest_reservation: config.skip_lowest_reservation,
        }
    }

    /// Current word
    pub fn word(&self) -> TidWord {
        TidWord::from_raw(self.word.load(Ordering::Relaxed))
    }

    pub fn data_version(&self) -> u64 {
        self.word().data_version()
    }

    pub fn is_latched(&self) -> bool {
        self.word().is_latched()
    }

    /// Version a committing writer can install when versions are not
    /// allocated globally
    pub fn next_data_version(&self) -> u64 {
        self.data_version() + 1
    }

    fn compare_exchange(&self, current: TidWord, next: TidWord) -> Result<TidWord, TidWord> {
        self.word
            .compare_exchange(current.raw(), next.raw(), Ordering::Relaxed, Ordering::Relaxed)
            .map(TidWord::from_raw)
            .map_err(TidWord::from_raw)
    }

    /// Load the word, spinning while a writer holds the latch
    fn load_unlatched(&self) -> TidWord {
        let backoff = Backoff::new();
        loop {
            let word = self.word();
            if !word.is_latched() {
                return word;
            }
            backoff.snooze();
        }
    }

    /// Current content, consistent with [`PrioRow::data_version`].
    ///
    /// Does not reserve; spins while the row is latched.
    pub fn read_snapshot(&self) -> Snapshot<D>
    where
        D: Clone,
    {
        loop {
            let before = self.load_unlatched();
            let data = self.data.read().clone();
            if self.word() == before {
                return Snapshot { data, version: before.data_version() };
            }
        }
    }

    /// Snapshot the row and reserve it at `txn`'s priority in one step.
    ///
    /// The reservation is installed by the same compare-and-swap that
    /// validates the copy, so the snapshot version is the one the
    /// reservation protects. A read whose priority is too low still succeeds;
    /// it just carries no reservation.
    pub fn access(&self, txn: &TxnHandle) -> Access<D>
    where
        D: Clone,
    {
        let priority = txn.priority();
        loop {
            let before = self.load_unlatched();
            let data = self.data.read().clone();
            let (next, reserve) = before.try_reserve(priority, self.skip_lowest_reservation);

            let installed = if reserve.is_reserved() { self.compare_exchange(before, next).is_ok() } else { self.word() == before };
            if !installed {
                continue;
            }

            self.log_reserve(before, priority, reserve);
            trace!(txn = %txn.id(), version = before.data_version(), ?reserve, "row accessed");
            return Access {
                snapshot: Snapshot { data, version: before.data_version() },
                reserve,
            };
        }
    }

    /// Reserve the row at `priority` without reading it.
    ///
    /// Works on a latched word too: the latch holder owns the content, not
    /// the reservation.
    pub fn reserve(&self, priority: Priority) -> ReserveOutcome {
        let mut current = self.word();
        loop {
            let (next, reserve) = current.try_reserve(priority, self.skip_lowest_reservation);
            if !reserve.is_reserved() {
                self.log_reserve(current, priority, reserve);
                return reserve;
            }
            match self.compare_exchange(current, next) {
                Ok(_) => {
                    self.log_reserve(current, priority, reserve);
                    return reserve;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn log_reserve(&self, before: TidWord, priority: Priority, reserve: ReserveOutcome) {
        match reserve {
            ReserveOutcome::Reserved(_) if priority > before.priority() && before.ref_count() > 0 => {
                debug!(from = %before.priority(), to = %priority, preempted = before.ref_count(), "priority takeover");
            }
            ReserveOutcome::Saturated => warn!(%priority, "reservation count saturated"),
            _ => {}
        }
    }

    /// Overwrite the content. Only the latch holder may write.
    pub fn apply_write(&self, data: &D) -> CcResult<()>
    where
        D: Clone,
    {
        if !self.is_latched() {
            return Err(CcError::NotLatched);
        }
        *self.data.write() = data.clone();
        Ok(())
    }

    /// Whether a value read at `old_version` is still current.
    ///
    /// A latched word fails validation unless the caller holds that latch.
    pub fn validate(&self, old_version: u64, self_owns_write: bool) -> bool {
        let word = self.word();
        if !self_owns_write && word.is_latched() {
            return false;
        }
        word.data_version() == old_version
    }

    /// Latch the row, spinning while another writer holds it.
    ///
    /// The reserved priority is checked before the latch on every attempt, so
    /// a higher reservation returns `PriorityConflict` at once, also while the
    /// row is latched. Only latch contention is waited out.
    pub fn acquire_lock(&self, priority: Priority) -> LockStatus {
        let backoff = Backoff::new();
        let mut current = self.word();
        loop {
            if current.priority() > priority {
                return LockStatus::PriorityConflict;
            }
            if current.is_latched() {
                backoff.snooze();
                current = self.word();
                continue;
            }
            match self.compare_exchange(current, current.latched()) {
                Ok(_) => {
                    trace!(%priority, version = current.data_version(), "row latched");
                    return LockStatus::Done;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Latch the row if it is free; never spins on a held latch.
    ///
    /// Priority is checked first, then a held latch reports `Taken`.
    pub fn try_acquire_lock(&self, priority: Priority) -> LockStatus {
        let mut current = self.word();
        loop {
            if current.priority() > priority {
                return LockStatus::PriorityConflict;
            }
            if current.is_latched() {
                return LockStatus::Taken;
            }
            match self.compare_exchange(current, current.latched()) {
                Ok(_) => return LockStatus::Done,
                Err(actual) => current = actual,
            }
        }
    }

    /// Clear the latch only, keeping reservation and version.
    ///
    /// Reservations may land on a latched word, so the bit is cleared in place.
    pub fn unlock(&self) {
        self.word.fetch_and(!LATCH_BIT, Ordering::Relaxed);
    }

    /// Drop a reader's reservation. No-op while latched or when stale.
    pub fn release_reader(&self, reservation: Reservation) {
        let mut current = self.word();
        loop {
            if current.is_latched() {
                return;
            }
            let next = current.release_reservation(reservation);
            if next == current {
                return;
            }
            match self.compare_exchange(current, next) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Abort path of a writer: release its reservation, if any, and the latch.
    ///
    /// The data version is unchanged.
    pub fn release_writer_abort(&self, reservation: Option<Reservation>) -> CcResult<()> {
        let mut current = self.word();
        loop {
            if !current.is_latched() {
                return Err(CcError::NotLatched);
            }
            let mut next = current.unlatched();
            if let Some(reservation) = reservation {
                next = next.release_reservation(reservation);
            }
            match self.compare_exchange(current, next) {
                Ok(_) => {
                    trace!(version = current.data_version(), "writer aborted");
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Commit path of a writer holding the latch: install `data_version`,
    /// drop every reservation and the latch, advance the epoch.
    ///
    /// `data_version` must be strictly greater than the current version;
    /// otherwise the word is left untouched, still latched, and
    /// `VersionNotAdvanced` is returned.
    pub fn release_writer_commit(&self, data_version: u64) -> CcResult<()> {
        let next = self.word().committed(data_version)?;
        self.word.store(next.raw(), Ordering::Relaxed);
        trace!(version = data_version, epoch = next.epoch(), "writer committed");
        Ok(())
    }
}
