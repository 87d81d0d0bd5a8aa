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

//! Deadlock-avoidance policies
//!
//! The row lock never decides on its own whether a conflicting request may
//! wait. It hands the requester and the transactions currently blocking it to
//! a [`WaitPolicy`] and follows the answer. Cycle detection proper lives
//! outside the kernel: with [`AlwaysWait`] every conflict queues and an
//! external detector aborts victims through `TxnHandle::request_abort`.

use std::sync::Arc;

use dotcc_common::TxnHandle;

use crate::config::WaitPolicyKind;

/// What to do with a request that cannot be granted now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDecision {
    /// Queue the request and block
    Wait,
    /// Refuse the request; the caller aborts its transaction
    Abort,
}

/// Decides whether a conflicting request may wait.
///
/// Called with the row latch held, so implementations must be cheap and must
/// not call back into the row.
#[cfg_attr(test, mockall::automock)]
pub trait WaitPolicy: Send + Sync {
    fn on_conflict(&self, requester: &TxnHandle, blockers: &[Arc<TxnHandle>]) -> WaitDecision;
}

/// Always queue; deadlocks are resolved by an external detector
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysWait;

impl WaitPolicy for AlwaysWait {
    fn on_conflict(&self, _requester: &TxnHandle, _blockers: &[Arc<TxnHandle>]) -> WaitDecision {
        WaitDecision::Wait
    }
}

/// Never queue
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWait;

impl WaitPolicy for NoWait {
    fn on_conflict(&self, _requester: &TxnHandle, _blockers: &[Arc<TxnHandle>]) -> WaitDecision {
        WaitDecision::Abort
    }
}

/// Wait-die: a requester older than every blocker waits, otherwise it dies.
///
/// Age is the start timestamp; ties fall back to the transaction id.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitDie;

impl WaitPolicy for WaitDie {
    fn on_conflict(&self, requester: &TxnHandle, blockers: &[Arc<TxnHandle>]) -> WaitDecision {
        let age = |txn: &TxnHandle| (txn.start_timestamp(), txn.id());
        if blockers.iter().all(|blocker| age(requester) < age(blocker)) {
            WaitDecision::Wait
        } else {
            WaitDecision::Abort
        }
    }
}

/// Instantiate a built-in policy
pub fn builtin_policy(kind: WaitPolicyKind) -> Arc<dyn WaitPolicy> {
    match kind {
        WaitPolicyKind::AlwaysWait => Arc::new(AlwaysWait),
        WaitPolicyKind::NoWait => Arc::new(NoWait),
        WaitPolicyKind::WaitDie => Arc::new(WaitDie),
    }
}
