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
//! Scenarios for the priority-preemptive protocol

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use dotcc_core::{CcConfig, CcContext, LockStatus, PrioRow, Priority, ReserveOutcome, RowId, TxnHandle};

fn prio(level: u8) -> Priority {
    Priority::new(level).unwrap()
}

#[test]
fn test_latch_handoff_between_writers() {
    let row = PrioRow::new(0u64);
    assert_eq!(row.acquire_lock(prio(2)), LockStatus::Done);
    assert_eq!(row.try_acquire_lock(prio(5)), LockStatus::Taken);

    row.release_writer_commit(1).unwrap();
    assert_eq!(row.try_acquire_lock(prio(5)), LockStatus::Done);
    assert_eq!(row.data_version(), 1);
}

#[test]
fn test_equal_priority_readers_share_reservation() {
    let row = PrioRow::new(());
    let (t1, t2, t3) = (TxnHandle::with_priority(1, prio(1)), TxnHandle::with_priority(2, prio(1)), TxnHandle::with_priority(3, prio(0)));

    let first = row.access(&t1).reservation().unwrap();
    let second = row.access(&t2).reservation().unwrap();
    assert_eq!(row.word().ref_count(), 2);
    assert_eq!(row.access(&t3).reserve, ReserveOutcome::PriorityConflict);

    let epoch = row.word().epoch();
    row.release_reader(first);
    row.release_reader(second);
    let word = row.word();
    assert_eq!(word.ref_count(), 0);
    assert_eq!(word.epoch(), epoch + 1);
    assert_eq!(word.priority(), Priority::LOWEST);
}

/// Optimistic read-modify-write of a counter at `priority`
fn increment(row: &PrioRow<u64>, txn: &TxnHandle) -> bool {
    let access = row.access(txn);
    let reservation = access.reservation();

    match row.acquire_lock(txn.priority()) {
        LockStatus::Done => {}
        _ => {
            if let Some(reservation) = reservation {
                row.release_reader(reservation);
            }
            return false;
        }
    }
    if !row.validate(access.snapshot.version, true) {
        row.release_writer_abort(reservation).unwrap();
        return false;
    }
    row.apply_write(&(access.snapshot.data + 1)).unwrap();
    row.release_writer_commit(access.snapshot.version + 1).unwrap();
    true
}

#[test]
fn test_high_priority_preempts_low_priority_writer() {
    let row = PrioRow::new(0u64);
    let low = TxnHandle::with_priority(1, prio(1));
    let high = TxnHandle::with_priority(2, prio(8));

    let low_read = row.access(&low);
    assert!(low_read.reservation().is_some());
    assert!(increment(&row, &high));

    // the low writer finds a newer version and backs off
    assert_eq!(row.acquire_lock(low.priority()), LockStatus::Done);
    assert!(!row.validate(low_read.snapshot.version, true));
    row.release_writer_abort(low_read.reservation()).unwrap();

    // the reservation is gone with the commit; a stale release changes nothing
    let before = row.word();
    row.release_reader(low_read.reservation().unwrap());
    assert_eq!(row.word(), before);
    assert_eq!(row.read_snapshot().data, 1);
}

#[test]
fn test_reserved_row_refuses_lower_writer() {
    let row = PrioRow::new(0u64);
    let high = TxnHandle::with_priority(1, prio(6));
    let low = TxnHandle::with_priority(2, prio(2));

    let high_read = row.access(&high);
    assert!(!increment(&row, &low));
    assert_eq!(row.data_version(), 0);

    row.release_reader(high_read.reservation().unwrap());
    assert!(increment(&row, &low));
    assert_eq!(row.data_version(), 1);
}

#[test]
fn test_mixed_priority_counter_is_exact() {
    let ctx = CcContext::new(CcConfig::priority()).unwrap();
    let row = Arc::new(ctx.new_row(RowId(1), 0u64));
    let retries = Arc::new(AtomicU32::new(0));

    let workers: Vec<_> = (0..4u64)
        .map(|worker| {
            let row = row.clone();
            let retries = retries.clone();
            thread::spawn(move || {
                let txn = TxnHandle::with_priority(worker, Priority::saturating(worker as u8 * 4));
                let prio_row = row.prio().unwrap();
                for _ in 0..200 {
                    while !increment(prio_row, &txn) {
                        retries.fetch_add(1, Ordering::Relaxed);
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let prio_row = row.prio().unwrap();
    let snapshot = prio_row.read_snapshot();
    assert_eq!(snapshot.data, 800);
    assert_eq!(snapshot.version, 800);
    assert_eq!(prio_row.word().ref_count(), 0);
}
