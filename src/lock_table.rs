//! Row-level exclusive locks with strict two-phase semantics.
//!
//! There is no deadlock detection: callers touching several rows in one
//! transaction must acquire locks in ascending row-id order, and every wait
//! is bounded by the caller's timeout. Waiters on the same row are served
//! first-in first-out.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};
use crate::granite_debug_log;
use crate::{RowId, TxId};

#[derive(Debug, Default)]
struct RowLock {
    owner: Option<TxId>,
    waiters: VecDeque<TxId>,
}

#[derive(Debug, Default)]
pub struct LockTable {
    rows: Mutex<HashMap<RowId, RowLock>>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the exclusive lock on `row_id` is granted, re-entrantly
    /// succeeding when `txid` already owns it. Fails with `LockTimeout` once
    /// `timeout` has elapsed.
    pub fn acquire(&self, txid: TxId, row_id: RowId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut rows = self.rows.lock();

        let entry = rows.entry(row_id).or_default();
        if entry.owner == Some(txid) {
            return Ok(());
        }
        if entry.owner.is_none() && entry.waiters.is_empty() {
            entry.owner = Some(txid);
            return Ok(());
        }

        granite_debug_log!("[LockTable] tx {txid} waiting on row {row_id}");
        entry.waiters.push_back(txid);
        loop {
            let timed_out = self.released.wait_until(&mut rows, deadline).timed_out();

            let entry = rows
                .get_mut(&row_id)
                .expect("lock entry exists while a waiter is queued");
            if entry.owner.is_none() && entry.waiters.front() == Some(&txid) {
                entry.waiters.pop_front();
                entry.owner = Some(txid);
                return Ok(());
            }

            if timed_out {
                entry.waiters.retain(|w| *w != txid);
                if entry.owner.is_none() && entry.waiters.is_empty() {
                    rows.remove(&row_id);
                }
                return Err(EngineError::LockTimeout(row_id));
            }
        }
    }

    /// Releases every lock owned by `txid` atomically (the shrinking phase)
    /// and wakes all waiters.
    pub fn release_all(&self, txid: TxId) {
        let mut rows = self.rows.lock();
        rows.retain(|_, lock| {
            if lock.owner == Some(txid) {
                lock.owner = None;
            }
            lock.owner.is_some() || !lock.waiters.is_empty()
        });
        self.released.notify_all();
    }

    pub fn holder(&self, row_id: RowId) -> Option<TxId> {
        self.rows.lock().get(&row_id).and_then(|lock| lock.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn acquire_is_reentrant_for_the_owner() {
        let locks = LockTable::new();
        locks.acquire(1, 7, LONG).unwrap();
        locks.acquire(1, 7, LONG).unwrap();
        assert_eq!(locks.holder(7), Some(1));
    }

    #[test]
    fn contended_acquire_times_out() {
        let locks = LockTable::new();
        locks.acquire(1, 7, LONG).unwrap();

        let err = locks.acquire(2, 7, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout(7)));
        // the timed-out waiter left no residue
        assert_eq!(locks.holder(7), Some(1));
    }

    #[test]
    fn release_all_hands_the_lock_to_a_blocked_waiter() {
        let locks = Arc::new(LockTable::new());
        locks.acquire(1, 7, LONG).unwrap();
        locks.acquire(1, 8, LONG).unwrap();

        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || locks.acquire(2, 7, LONG))
        };
        thread::sleep(Duration::from_millis(50));
        locks.release_all(1);

        waiter.join().unwrap().unwrap();
        assert_eq!(locks.holder(7), Some(2));
        assert_eq!(locks.holder(8), None);
    }

    #[test]
    fn waiters_are_served_in_fifo_order() {
        let locks = Arc::new(LockTable::new());
        locks.acquire(1, 7, LONG).unwrap();

        let mut handles = Vec::new();
        for txid in 2..=4 {
            let locks = locks.clone();
            handles.push(thread::spawn(move || {
                locks.acquire(txid, 7, LONG).unwrap();
                let granted = Instant::now();
                thread::sleep(Duration::from_millis(20));
                locks.release_all(txid);
                (txid, granted)
            }));
            // queue the waiters in a known order
            thread::sleep(Duration::from_millis(50));
        }
        locks.release_all(1);

        let mut grants: Vec<(TxId, Instant)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        grants.sort_by_key(|&(_, at)| at);
        let order: Vec<TxId> = grants.iter().map(|&(txid, _)| txid).collect();
        assert_eq!(order, vec![2, 3, 4]);
    }

    #[test]
    fn a_late_acquirer_queues_behind_existing_waiters() {
        let locks = Arc::new(LockTable::new());
        locks.acquire(1, 7, LONG).unwrap();

        let first = {
            let locks = locks.clone();
            thread::spawn(move || {
                locks.acquire(2, 7, LONG).unwrap();
                locks.release_all(2);
            })
        };
        thread::sleep(Duration::from_millis(50));

        // tx 3 arrives while tx 2 is queued; even after tx 1 releases, tx 3
        // must not overtake
        let second = {
            let locks = locks.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                locks.acquire(3, 7, LONG).unwrap();
                assert_eq!(locks.holder(7), Some(3));
                locks.release_all(3);
            })
        };
        thread::sleep(Duration::from_millis(60));
        locks.release_all(1);

        first.join().unwrap();
        second.join().unwrap();
    }
}
