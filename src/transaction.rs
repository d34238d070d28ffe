//! Transaction lifecycle and the active-transaction table.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::undo::UndoRecord;
use crate::wal::Lsn;
use crate::{RowId, TxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

/// A transaction handle. Created Active, moved to a terminal state by commit
/// or rollback; terminal states are absorbing. The handle owns the undo log
/// and the set of rows locked so far; the caller passes it to every engine
/// operation.
#[derive(Debug)]
pub struct Transaction {
    txid: TxId,
    state: TxState,
    pub(crate) undo: Vec<UndoRecord>,
    pub(crate) locks_held: HashSet<RowId>,
    pub(crate) first_lsn: Lsn,
    pub(crate) last_lsn: Lsn,
}

impl Transaction {
    fn new(txid: TxId) -> Self {
        Self {
            txid,
            state: TxState::Active,
            undo: Vec::new(),
            locks_held: HashSet::new(),
            first_lsn: 0,
            last_lsn: 0,
        }
    }

    pub fn txid(&self) -> TxId {
        self.txid
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// LSN of the transaction's first redo record (0 before any write).
    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    /// LSN of the transaction's latest redo record (0 before any write).
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    pub(crate) fn set_state(&mut self, state: TxState) {
        self.state = state;
    }

    pub(crate) fn record_lsn(&mut self, lsn: Lsn) {
        if self.first_lsn == 0 {
            self.first_lsn = lsn;
        }
        self.last_lsn = lsn;
    }

    /// A transaction with no redo records has nothing to make durable.
    pub(crate) fn is_read_only(&self) -> bool {
        self.last_lsn == 0
    }
}

#[derive(Debug, Default)]
struct ActiveTx {
    first_lsn: Lsn,
}

/// Vends monotone transaction ids and tracks which transactions are still
/// in flight, with the first LSN each one touched. The checkpoint reads the
/// table to bound redo log truncation.
#[derive(Debug)]
pub struct TransactionManager {
    next_txid: AtomicU64,
    active: Mutex<HashMap<TxId, ActiveTx>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self {
            next_txid: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> Transaction {
        let txid = self.next_txid.fetch_add(1, Ordering::SeqCst);
        self.active.lock().insert(txid, ActiveTx::default());
        Transaction::new(txid)
    }

    pub(crate) fn record_lsn(&self, txid: TxId, lsn: Lsn) {
        let mut active = self.active.lock();
        if let Some(entry) = active.get_mut(&txid) {
            if entry.first_lsn == 0 {
                entry.first_lsn = lsn;
            }
        }
    }

    /// Deregisters a transaction that reached a terminal state.
    pub(crate) fn finish(&self, txid: TxId) {
        self.active.lock().remove(&txid);
    }

    pub fn is_active(&self, txid: TxId) -> bool {
        self.active.lock().contains_key(&txid)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// The smallest LSN still needed by an in-flight transaction, if any
    /// in-flight transaction has logged work.
    pub(crate) fn min_active_first_lsn(&self) -> Option<Lsn> {
        self.active
            .lock()
            .values()
            .map(|entry| entry.first_lsn)
            .filter(|&lsn| lsn != 0)
            .min()
    }

    /// Whether any of the given transactions is still in flight. The buffer
    /// pool asks this before letting a dirty frame reach disk.
    pub(crate) fn any_active(&self, txids: &HashSet<TxId>) -> bool {
        let active = self.active.lock();
        txids.iter().any(|txid| active.contains_key(txid))
    }

    /// Moves txid vending past everything seen in the recovered log.
    pub(crate) fn resume_after(&self, max_txid: TxId) {
        self.next_txid.fetch_max(max_txid + 1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_vends_monotone_txids_and_tracks_activity() {
        let tm = TransactionManager::new();
        let t1 = tm.begin();
        let t2 = tm.begin();

        assert_eq!((t1.txid(), t2.txid()), (1, 2));
        assert_eq!(t1.state(), TxState::Active);
        assert!(tm.is_active(1) && tm.is_active(2));

        tm.finish(1);
        assert!(!tm.is_active(1));
        assert_eq!(tm.active_count(), 1);
    }

    #[test]
    fn truncation_bound_tracks_the_oldest_logged_transaction() {
        let tm = TransactionManager::new();
        let t1 = tm.begin();
        let t2 = tm.begin();
        let _idle = tm.begin();

        assert_eq!(tm.min_active_first_lsn(), None);
        tm.record_lsn(t1.txid(), 7);
        tm.record_lsn(t1.txid(), 9);
        tm.record_lsn(t2.txid(), 8);

        // first LSN sticks; the idle transaction does not pin the log
        assert_eq!(tm.min_active_first_lsn(), Some(7));
        tm.finish(t1.txid());
        assert_eq!(tm.min_active_first_lsn(), Some(8));
    }

    #[test]
    fn resume_after_skips_recovered_txids() {
        let tm = TransactionManager::new();
        tm.resume_after(41);
        assert_eq!(tm.begin().txid(), 42);
    }

    #[test]
    fn transaction_remembers_its_first_and_last_lsn() {
        let tm = TransactionManager::new();
        let mut tx = tm.begin();
        assert!(tx.is_read_only());

        tx.record_lsn(5);
        tx.record_lsn(11);
        assert_eq!((tx.first_lsn, tx.last_lsn), (5, 11));
        assert!(!tx.is_read_only());
    }
}
