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
//! Priority-preemptive optimistic CC
//!
//! [`TidWord`] is the packed version word; [`PrioRow`] owns one atomically
//! and runs the reservation and latch protocol over it.

pub mod prio_row;
pub mod tid_word;

pub use prio_row::{Access, LockStatus, PrioRow, Snapshot};
pub use tid_word::{MAX_DATA_VERSION, MAX_EPOCH, MAX_REF_COUNT, Reservation, ReserveOutcome, TidWord};
