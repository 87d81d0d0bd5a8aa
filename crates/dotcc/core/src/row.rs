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
//! Rows and the store-wide CC context
//!
//! A [`Row`] owns exactly one CC state, chosen when it is created. All rows
//! built by one [`CcContext`] share its algorithm and wait policy.

use std::fmt;
use std::sync::Arc;

use dotcc_common::RowId;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::{CcAlgorithm, CcConfig};
use crate::error::{CcError, CcResult};
use crate::lock_manager::{RowLock, WaitPolicy, builtin_policy};
use crate::priority::PrioRow;

/// Per-row CC state
#[derive(Debug)]
pub enum RowCc<D> {
    /// Lock-based: content is guarded logically by `lock`; the `RwLock` only
    /// makes the access memory safe
    Locking { lock: RowLock, data: RwLock<D> },
    /// Priority-preemptive optimistic CC
    Priority(PrioRow<D>),
}

impl<D> RowCc<D> {
    pub fn algorithm(&self) -> CcAlgorithm {
        match self {
            RowCc::Locking { .. } => CcAlgorithm::Locking,
            RowCc::Priority(_) => CcAlgorithm::Priority,
        }
    }
}

/// A row with its CC state
#[derive(Debug)]
pub struct Row<D> {
    id: RowId,
    cc: RowCc<D>,
}

impl<D> Row<D> {
    pub fn new(id: RowId, cc: RowCc<D>) -> Self {
        Self { id, cc }
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn cc(&self) -> &RowCc<D> {
        &self.cc
    }

    pub fn algorithm(&self) -> CcAlgorithm {
        self.cc.algorithm()
    }

    fn mismatch(&self, expected: CcAlgorithm) -> CcError {
        CcError::AlgorithmMismatch {
            expected: expected.name(),
            actual: self.algorithm().name(),
        }
    }

    /// Lock and content of a lock-based row
    pub fn locking(&self) -> CcResult<(&RowLock, &RwLock<D>)> {
        match &self.cc {
            RowCc::Locking { lock, data } => Ok((lock, data)),
            RowCc::Priority(_) => Err(self.mismatch(CcAlgorithm::Locking)),
        }
    }

    pub fn lock(&self) -> CcResult<&RowLock> {
        self.locking().map(|(lock, _)| lock)
    }

    /// State of a priority-CC row
    pub fn prio(&self) -> CcResult<&PrioRow<D>> {
        match &self.cc {
            RowCc::Priority(prio) => Ok(prio),
            RowCc::Locking { .. } => Err(self.mismatch(CcAlgorithm::Priority)),
        }
    }
}

/// Store-wide CC settings applied to every row it creates
#[derive(Clone)]
pub struct CcContext {
    config: CcConfig,
    policy: Arc<dyn WaitPolicy>,
}

impl fmt::Debug for CcContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CcContext").field("config", &self.config).finish_non_exhaustive()
    }
}

impl CcContext {
    /// Context using the built-in wait policy named by the configuration
    pub fn new(config: CcConfig) -> CcResult<Self> {
        let policy = builtin_policy(config.lock.wait_policy);
        Self::with_policy(config, policy)
    }

    /// Context with a caller-supplied wait policy
    pub fn with_policy(config: CcConfig, policy: Arc<dyn WaitPolicy>) -> CcResult<Self> {
        config.validate()?;
        debug!(algorithm = config.algorithm.name(), "cc context created");
        Ok(Self { config, policy })
    }

    pub fn config(&self) -> &CcConfig {
        &self.config
    }

    pub fn algorithm(&self) -> CcAlgorithm {
        self.config.algorithm
    }

    /// Build a row holding `data` under the configured algorithm
    pub fn new_row<D>(&self, id: RowId, data: D) -> Row<D> {
        let cc = match self.config.algorithm {
            CcAlgorithm::Locking => RowCc::Locking {
                lock: RowLock::with_config(id, &self.config.lock, self.policy.clone()),
                data: RwLock::new(data),
            },
            CcAlgorithm::Priority => RowCc::Priority(PrioRow::with_config(data, &self.config.priority)),
        };
        Row::new(id, cc)
    }
}
