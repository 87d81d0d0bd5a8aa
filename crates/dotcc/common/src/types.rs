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

//! Identifier and priority types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returned when a priority level does not fit in the version word
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("priority level {0} exceeds the maximum of {max}", max = Priority::MAX_LEVEL)]
pub struct InvalidPriority(pub u8);

/// Priority level of a transaction.
///
/// Level 0 is the lowest tier and doubles as "no reservation" inside a row's
/// version word. Higher levels preempt lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// Highest representable level (the version word reserves 4 bits)
    pub const MAX_LEVEL: u8 = 15;
    /// Number of distinct priority levels
    pub const NUM_LEVELS: usize = Self::MAX_LEVEL as usize + 1;
    /// The lowest tier, also the value of an unreserved word
    pub const LOWEST: Priority = Priority(0);
    /// The highest tier
    pub const HIGHEST: Priority = Priority(Self::MAX_LEVEL);

    /// Create a priority, rejecting levels above [`Priority::MAX_LEVEL`]
    pub const fn new(level: u8) -> Result<Self, InvalidPriority> {
        if level > Self::MAX_LEVEL { Err(InvalidPriority(level)) } else { Ok(Self(level)) }
    }

    /// Create a priority, clamping to [`Priority::MAX_LEVEL`]
    pub const fn saturating(level: u8) -> Self {
        if level > Self::MAX_LEVEL { Self::HIGHEST } else { Self(level) }
    }

    /// Numeric level
    pub const fn level(self) -> u8 {
        self.0
    }

    pub const fn is_lowest(self) -> bool {
        self.0 == 0
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidPriority;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}
