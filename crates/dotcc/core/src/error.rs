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

//! Error types for the CC kernel.
//!
//! Expected contention is not an error: waits, aborts, taken latches and
//! priority conflicts are reported through outcome enums. `CcError` covers
//! API misuse and configuration failures.

use dotcc_common::TxnId;

/// Error types of the CC kernel
#[derive(Debug, thiserror::Error)]
pub enum CcError {
    #[error("Transaction {0} holds no entry on this row")]
    NotHeld(TxnId),

    #[error("Transaction {0} is not an owner of this row")]
    NotOwner(TxnId),

    #[error("Transaction {0} already has an entry on this row")]
    DuplicateRequest(TxnId),

    #[error("Transaction {0} is not waiting on this row")]
    NotWaiting(TxnId),

    #[error("Row is not latched")]
    NotLatched,

    #[error("Data version {0} does not fit in the version word")]
    VersionOverflow(u64),

    #[error("Data version {proposed} does not advance past {current}")]
    VersionNotAdvanced { current: u64, proposed: u64 },

    #[error("Row uses the {actual} algorithm, not {expected}")]
    AlgorithmMismatch { expected: &'static str, actual: &'static str },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for CC operations
pub type CcResult<T> = std::result::Result<T, CcError>;

impl From<std::io::Error> for CcError {
    fn from(err: std::io::Error) -> Self {
        CcError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for CcError {
    fn from(err: toml::de::Error) -> Self {
        CcError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for CcError {
    fn from(err: toml::ser::Error) -> Self {
        CcError::Config(err.to_string())
    }
}
