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

//! Shared types for the DotCC row-level concurrency control kernel.
//!
//! This crate holds the pieces every CC algorithm consumes but none of them
//! owns: transaction identity, priority levels and the per-transaction wait
//! slot a lock manager parks a blocked caller on.

pub mod txn;
pub mod types;

pub use txn::{TxnHandle, WaitOutcome};
pub use types::{InvalidPriority, Priority, RowId, TxnId};
