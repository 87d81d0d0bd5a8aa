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

//! DotCC core: row-level concurrency control
//!
//! Two interchangeable per-row CC primitives:
//!
//! - [`lock_manager::RowLock`]: a retirement-aware shared/exclusive lock with
//!   owner, waiter and retired queues over a pooled entry arena. Blocking
//!   callers park on their own [`TxnHandle`]; blocker identities are reported
//!   to an external deadlock detector.
//! - [`priority::PrioRow`]: an optimistic, priority-preemptive protocol on a
//!   single packed [`priority::TidWord`]. It never parks; it spins briefly on
//!   the latch bit and otherwise returns a typed outcome.
//!
//! Which one a store uses is a store-wide choice made through [`CcConfig`]
//! and applied by [`CcContext`] when rows are created.

pub mod config;
pub mod error;
pub mod lock_manager;
pub mod priority;
pub mod row;

pub use config::{CcAlgorithm, CcConfig, LockConfig, PriorityConfig, WaitPolicyKind};
pub use dotcc_common::{Priority, RowId, TxnHandle, TxnId, WaitOutcome};
pub use error::{CcError, CcResult};
pub use lock_manager::{AlwaysWait, EntryQueue, LockMode, LockOutcome, NoWait, RowLock, RowLockStatistics, WaitDecision, WaitDie, WaitPolicy};
pub use priority::{Access, LockStatus, PrioRow, Reservation, ReserveOutcome, Snapshot, TidWord};
pub use row::{CcContext, Row, RowCc};
