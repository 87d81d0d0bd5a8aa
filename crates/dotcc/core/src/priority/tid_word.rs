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
//! Packed per-row version word
//!
//! One `u64` holds everything the priority protocol needs to arbitrate a row:
//!
//! ```text
//!  63                          28 27        16 15    12 11        1   0
//! +------------------------------+------------+--------+-----------+---+
//! |         data version         |  ref count |  prio  |   epoch   | L |
//! +------------------------------+------------+--------+-----------+---+
//! ```
//!
//! `TidWord` is a plain value. Every transition is computed on a copy and
//! installed by the owner of the atomic with a single compare-and-swap (or a
//! store, for commit release, which the latch holder owns).

use std::fmt;

use dotcc_common::Priority;

use crate::error::{CcError, CcResult};

pub(crate) const LATCH_BIT: u64 = 1;

const EPOCH_SHIFT: u32 = 1;
const EPOCH_BITS: u32 = 11;
const EPOCH_MASK: u64 = ((1 << EPOCH_BITS) - 1) << EPOCH_SHIFT;

const PRIO_SHIFT: u32 = 12;
const PRIO_BITS: u32 = 4;
const PRIO_MASK: u64 = ((1 << PRIO_BITS) - 1) << PRIO_SHIFT;

const REF_SHIFT: u32 = 16;
const REF_BITS: u32 = 12;
const REF_MASK: u64 = ((1 << REF_BITS) - 1) << REF_SHIFT;

const VERSION_SHIFT: u32 = 28;
const VERSION_BITS: u32 = 36;

/// Largest epoch before it wraps to zero
pub const MAX_EPOCH: u16 = (1 << EPOCH_BITS) - 1;

/// Largest number of live reservations at one priority level
pub const MAX_REF_COUNT: u32 = (1 << REF_BITS) - 1;

/// Largest data version the word can carry
pub const MAX_DATA_VERSION: u64 = (1 << VERSION_BITS) - 1;

const _: () = assert!(EPOCH_SHIFT + EPOCH_BITS == PRIO_SHIFT);
const _: () = assert!(PRIO_SHIFT + PRIO_BITS == REF_SHIFT);
const _: () = assert!(REF_SHIFT + REF_BITS == VERSION_SHIFT);
const _: () = assert!(VERSION_SHIFT + VERSION_BITS == u64::BITS);
const _: () = assert!(Priority::NUM_LEVELS == 1 << PRIO_BITS);

/// Token handed out by a successful reservation.
///
/// Releasing it only has an effect while the word still carries the same
/// priority and epoch; otherwise the reservation was preempted or already
/// drained and the release is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reservation {
    pub priority: Priority,
    pub epoch: u16,
}

/// Result of reserving a row at some priority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The reservation is live; release it with the returned token
    Reserved(Reservation),
    /// Lowest-level reservation skipped by configuration
    Skipped,
    /// A higher priority holds the row
    PriorityConflict,
    /// The reference count is full at this level
    Saturated,
}

impl ReserveOutcome {
    pub fn reservation(self) -> Option<Reservation> {
        match self {
            ReserveOutcome::Reserved(reservation) => Some(reservation),
            _ => None,
        }
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, ReserveOutcome::Reserved(_))
    }
}

/// The packed version word of one row
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TidWord(u64);

impl TidWord {
    /// Unlatched, unreserved word at `data_version`, epoch zero
    pub fn new(data_version: u64) -> CcResult<Self> {
        if data_version > MAX_DATA_VERSION {
            return Err(CcError::VersionOverflow(data_version));
        }
        Ok(Self(data_version << VERSION_SHIFT))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_latched(self) -> bool {
        self.0 & LATCH_BIT != 0
    }

    pub const fn epoch(self) -> u16 {
        ((self.0 & EPOCH_MASK) >> EPOCH_SHIFT) as u16
    }

    pub const fn priority(self) -> Priority {
        Priority::saturating(((self.0 & PRIO_MASK) >> PRIO_SHIFT) as u8)
    }

    pub const fn ref_count(self) -> u32 {
        ((self.0 & REF_MASK) >> REF_SHIFT) as u32
    }

    pub const fn data_version(self) -> u64 {
        self.0 >> VERSION_SHIFT
    }

    /// Copy with the latch bit set
    pub const fn latched(self) -> Self {
        Self(self.0 | LATCH_BIT)
    }

    /// Copy with the latch bit cleared
    pub const fn unlatched(self) -> Self {
        Self(self.0 & !LATCH_BIT)
    }

    /// Copy with `epoch`, truncated to the field width
    pub const fn with_epoch(self, epoch: u16) -> Self {
        Self((self.0 & !EPOCH_MASK) | (((epoch as u64) << EPOCH_SHIFT) & EPOCH_MASK))
    }

    pub const fn with_priority(self, priority: Priority) -> Self {
        Self((self.0 & !PRIO_MASK) | ((priority.level() as u64) << PRIO_SHIFT))
    }

    /// Copy with `count`, truncated to the field width
    pub const fn with_ref_count(self, count: u32) -> Self {
        Self((self.0 & !REF_MASK) | (((count as u64) << REF_SHIFT) & REF_MASK))
    }

    const fn next_epoch(self) -> u16 {
        (self.epoch() + 1) & MAX_EPOCH
    }

    /// Reservation token matching the word's current priority and epoch
    pub const fn reservation(self) -> Reservation {
        Reservation { priority: self.priority(), epoch: self.epoch() }
    }

    /// Compute the word after reserving at `priority`.
    ///
    /// Equal priority joins the current holders, a higher one takes the row
    /// over with a fresh count of one, a lower one fails. When the outcome is
    /// not `Reserved` the returned word is `self`.
    pub fn try_reserve(self, priority: Priority, skip_lowest: bool) -> (Self, ReserveOutcome) {
        let current = self.priority();
        if priority == current {
            if skip_lowest && priority.is_lowest() {
                return (self, ReserveOutcome::Skipped);
            }
            let count = self.ref_count();
            if count >= MAX_REF_COUNT {
                return (self, ReserveOutcome::Saturated);
            }
            let next = self.with_ref_count(count + 1);
            return (next, ReserveOutcome::Reserved(next.reservation()));
        }
        if priority > current {
            let next = self.with_priority(priority).with_ref_count(1);
            return (next, ReserveOutcome::Reserved(next.reservation()));
        }
        (self, ReserveOutcome::PriorityConflict)
    }

    /// Compute the word after releasing `reservation`.
    ///
    /// Stale tokens leave the word unchanged. The last release resets the
    /// priority and bumps the epoch so older tokens can never match again.
    pub fn release_reservation(self, reservation: Reservation) -> Self {
        if self.priority() != reservation.priority || self.epoch() != reservation.epoch {
            return self;
        }
        match self.ref_count() {
            0 => self,
            1 => self.with_ref_count(0).with_priority(Priority::LOWEST).with_epoch(self.next_epoch()),
            count => self.with_ref_count(count - 1),
        }
    }

    /// Word installed by a committing writer: new data version, next epoch,
    /// unlatched and unreserved.
    ///
    /// `data_version` must be strictly greater than the current one.
    pub fn committed(self, data_version: u64) -> CcResult<Self> {
        if data_version <= self.data_version() {
            return Err(CcError::VersionNotAdvanced {
                current: self.data_version(),
                proposed: data_version,
            });
        }
        Ok(Self::new(data_version)?.with_epoch(self.next_epoch()))
    }
}

impl fmt::Debug for TidWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TidWord")
            .field("latched", &self.is_latched())
            .field("epoch", &self.epoch())
            .field("priority", &self.priority().level())
            .field("ref_count", &self.ref_count())
            .field("data_version", &self.data_version())
            .finish()
    }
}

impl fmt::Display for TidWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<TidWord> for u64 {
    fn from(word: TidWord) -> Self {
        word.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn prio(level: u8) -> Priority {
        Priority::new(level).unwrap()
    }

    #[test]
    fn test_field_layout() {
        let word = TidWord::new(5).unwrap().latched().with_epoch(3).with_priority(prio(7)).with_ref_count(2);
        assert_eq!(word.raw(), (5 << 28) | (2 << 16) | (7 << 12) | (3 << 1) | 1);
        assert!(word.is_latched());
        assert_eq!(word.epoch(), 3);
        assert_eq!(word.priority(), prio(7));
        assert_eq!(word.ref_count(), 2);
        assert_eq!(word.data_version(), 5);
        assert_eq!(u64::from(word), word.raw());
    }

    #[test]
    fn test_field_maxima_do_not_bleed() {
        let word = TidWord::new(MAX_DATA_VERSION).unwrap().with_epoch(MAX_EPOCH).with_priority(Priority::HIGHEST).with_ref_count(MAX_REF_COUNT);
        assert!(!word.is_latched());
        assert_eq!(word.raw(), u64::MAX & !LATCH_BIT);
        assert_eq!(word.with_epoch(0).epoch(), 0);
        assert_eq!(word.with_epoch(0).ref_count(), MAX_REF_COUNT);
    }

    #[test]
    fn test_new_rejects_wide_versions() {
        assert!(TidWord::new(MAX_DATA_VERSION).is_ok());
        assert!(matches!(TidWord::new(MAX_DATA_VERSION + 1), Err(CcError::VersionOverflow(v)) if v == MAX_DATA_VERSION + 1));
    }

    #[test]
    fn test_latch_toggles_only_latch() {
        let word = TidWord::new(9).unwrap().with_priority(prio(2)).with_ref_count(1);
        assert_eq!(word.latched().unlatched(), word);
        assert_eq!(word.latched().reservation(), word.reservation());
    }

    #[test]
    fn test_reserve_equal_priority_counts() {
        let word = TidWord::new(1).unwrap();
        let (word, outcome) = word.try_reserve(prio(1), false);
        assert_eq!(outcome, ReserveOutcome::Reserved(Reservation { priority: prio(1), epoch: 0 }));
        let (word, outcome) = word.try_reserve(prio(1), false);
        assert!(outcome.is_reserved());
        assert_eq!(word.ref_count(), 2);
        assert_eq!(word.priority(), prio(1));
    }

    #[test]
    fn test_reserve_higher_priority_takes_over() {
        let (word, _) = TidWord::new(1).unwrap().try_reserve(prio(2), false);
        let (word, _) = word.try_reserve(prio(2), false);
        let (word, outcome) = word.try_reserve(prio(9), false);
        assert!(outcome.is_reserved());
        assert_eq!(word.priority(), prio(9));
        assert_eq!(word.ref_count(), 1);
    }

    #[test]
    fn test_reserve_lower_priority_fails() {
        let (word, _) = TidWord::new(1).unwrap().try_reserve(prio(4), false);
        let (after, outcome) = word.try_reserve(prio(3), false);
        assert_eq!(outcome, ReserveOutcome::PriorityConflict);
        assert_eq!(after, word);
    }

    #[test]
    fn test_skip_lowest_reservation() {
        let word = TidWord::new(1).unwrap();
        assert_eq!(word.try_reserve(Priority::LOWEST, true), (word, ReserveOutcome::Skipped));
        assert!(word.try_reserve(Priority::LOWEST, false).1.is_reserved());
        assert!(word.try_reserve(prio(1), true).1.is_reserved());
    }

    #[test]
    fn test_reserve_saturates() {
        let word = TidWord::new(1).unwrap().with_priority(prio(3)).with_ref_count(MAX_REF_COUNT);
        assert_eq!(word.try_reserve(prio(3), false), (word, ReserveOutcome::Saturated));
        // a takeover still works at a full count
        assert_eq!(word.try_reserve(prio(4), false).0.ref_count(), 1);
    }

    #[test]
    fn test_last_release_resets_priority_and_bumps_epoch() {
        let (word, first) = TidWord::new(1).unwrap().try_reserve(prio(1), false);
        let (word, second) = word.try_reserve(prio(1), false);
        let (word, third) = word.try_reserve(Priority::LOWEST, false);
        assert_eq!(third, ReserveOutcome::PriorityConflict);

        let word = word.release_reservation(first.reservation().unwrap());
        assert_eq!(word.ref_count(), 1);
        let word = word.release_reservation(second.reservation().unwrap());
        assert_eq!(word.ref_count(), 0);
        assert_eq!(word.priority(), Priority::LOWEST);
        assert_eq!(word.epoch(), 1);
    }

    #[test]
    fn test_preempted_release_is_noop() {
        let (word, low) = TidWord::new(1).unwrap().try_reserve(prio(1), false);
        let (word, _) = word.try_reserve(prio(5), false);
        assert_eq!(word.release_reservation(low.reservation().unwrap()), word);
    }

    #[test]
    fn test_stale_epoch_release_is_noop() {
        let (word, token) = TidWord::new(1).unwrap().try_reserve(prio(2), false);
        let token = token.reservation().unwrap();
        let drained = word.release_reservation(token);
        let (word, _) = drained.try_reserve(prio(2), false);
        assert_eq!(word.release_reservation(token), word);
    }

    #[test]
    fn test_commit_word() {
        let word = TidWord::new(4).unwrap().with_epoch(6).with_priority(prio(3)).with_ref_count(2).latched();
        let committed = word.committed(5).unwrap();
        assert!(!committed.is_latched());
        assert_eq!(committed.epoch(), 7);
        assert_eq!(committed.priority(), Priority::LOWEST);
        assert_eq!(committed.ref_count(), 0);
        assert_eq!(committed.data_version(), 5);

        assert_eq!(word.with_epoch(MAX_EPOCH).committed(5).unwrap().epoch(), 0);
        assert!(word.committed(MAX_DATA_VERSION + 1).is_err());
    }

    #[test]
    fn test_commit_must_advance_version() {
        let word = TidWord::new(4).unwrap().latched();
        assert!(matches!(word.committed(4), Err(CcError::VersionNotAdvanced { current: 4, proposed: 4 })));
        assert!(matches!(word.committed(3), Err(CcError::VersionNotAdvanced { current: 4, proposed: 3 })));
        assert_eq!(word.committed(5).unwrap().data_version(), 5);
    }

    #[test]
    fn test_debug_and_display() {
        let word = TidWord::new(1).unwrap().latched();
        assert_eq!(word.to_string(), "0x0000000010000001");
        assert!(format!("{word:?}").contains("latched: true"));
    }

    fn any_word() -> impl Strategy<Value = TidWord> {
        any::<u64>().prop_map(TidWord::from_raw)
    }

    fn any_priority() -> impl Strategy<Value = Priority> {
        (0..=Priority::MAX_LEVEL).prop_map(Priority::saturating)
    }

    proptest! {
        #[test]
        fn prop_fields_round_trip(version in 0..=MAX_DATA_VERSION, epoch in 0..=MAX_EPOCH, priority in any_priority(), refs in 0..=MAX_REF_COUNT, latched in any::<bool>()) {
            let mut word = TidWord::new(version).unwrap().with_epoch(epoch).with_priority(priority).with_ref_count(refs);
            if latched {
                word = word.latched();
            }
            prop_assert_eq!(word.data_version(), version);
            prop_assert_eq!(word.epoch(), epoch);
            prop_assert_eq!(word.priority(), priority);
            prop_assert_eq!(word.ref_count(), refs);
            prop_assert_eq!(word.is_latched(), latched);
        }

        #[test]
        fn prop_ascending_reservations_keep_highest(mut levels in proptest::collection::vec(any_priority(), 1..32)) {
            levels.sort();
            let top = *levels.last().unwrap();
            let expected = levels.iter().filter(|level| **level == top).count() as u32;

            let mut word = TidWord::new(1).unwrap();
            for level in &levels {
                let (next, outcome) = word.try_reserve(*level, false);
                prop_assert!(outcome.is_reserved());
                word = next;
            }
            prop_assert_eq!(word.priority(), top);
            prop_assert_eq!(word.ref_count(), expected);
        }

        #[test]
        fn prop_reserve_never_touches_version_or_latch(word in any_word(), priority in any_priority(), skip in any::<bool>()) {
            let (next, _) = word.try_reserve(priority, skip);
            prop_assert_eq!(next.data_version(), word.data_version());
            prop_assert_eq!(next.is_latched(), word.is_latched());
            prop_assert_eq!(next.epoch(), word.epoch());
        }

        #[test]
        fn prop_mismatched_release_is_noop(word in any_word(), priority in any_priority(), epoch in 0..=MAX_EPOCH) {
            prop_assume!(priority != word.priority() || epoch != word.epoch());
            prop_assert_eq!(word.release_reservation(Reservation { priority, epoch }), word);
        }

        #[test]
        fn prop_commit_unlatches_with_new_version((old, version) in (0..MAX_DATA_VERSION).prop_flat_map(|old| (Just(old), old + 1..=MAX_DATA_VERSION)), low in any::<u64>()) {
            let word = TidWord::from_raw((old << VERSION_SHIFT) | (low & ((1 << VERSION_SHIFT) - 1)));
            let committed = word.latched().committed(version).unwrap();
            prop_assert!(!committed.is_latched());
            prop_assert_eq!(committed.ref_count(), 0);
            prop_assert_eq!(committed.data_version(), version);
            prop_assert_eq!(committed.epoch(), (word.epoch() + 1) & MAX_EPOCH);
        }
    }
}
