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

//! Retirement-aware row lock manager
//!
//! Provides the per-row shared/exclusive lock with owner, waiter and retired
//! queues, the entry pool those queues are built on, and the pluggable
//! deadlock-avoidance policies consulted on conflict.

pub mod entry_pool;
pub mod policy;
pub mod row_lock;

// Public exports
pub use entry_pool::{EntryHandle, EntryPool, LockEntry, PoolStats};
pub use policy::{AlwaysWait, NoWait, WaitDecision, WaitDie, WaitPolicy, builtin_policy};
pub use row_lock::{EntryQueue, EntryState, LockMode, LockOutcome, RowLock, RowLockStatistics};
