//! The engine facade: composes the storage subsystems and drives the
//! transaction operations, checkpointing, and crash recovery.

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::btree::BPlusTree;
use crate::buffer_pool::{BufferPool, PageGuard};
use crate::codec;
use crate::disk::{DiskStore, INDEX_ARTIFACT};
use crate::dwb::DoubleWrite;
use crate::error::{EngineError, Result};
use crate::failpoint;
use crate::granite_debug_log;
use crate::lock_table::LockTable;
use crate::page::Row;
use crate::transaction::{Transaction, TransactionManager, TxState};
use crate::undo::UndoRecord;
use crate::wal::{Lsn, RedoLog, RedoOp};
use crate::{PageId, RowId, TxId};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory of the blob store. No default.
    pub data_dir: PathBuf,
    /// Number of buffer pool frames.
    pub buffer_pool_size: usize,
    /// Maximum rows per page.
    pub page_capacity: usize,
    /// Minimum degree of the row index B+Tree.
    pub bplustree_t: usize,
    /// Upper bound on any single lock wait.
    pub lock_timeout: Duration,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            buffer_pool_size: 64,
            page_capacity: 16,
            bplustree_t: 3,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// The storage engine. One instance per data directory, shared freely across
/// threads; each transaction stays on the thread that began it.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    disk: Arc<DiskStore>,
    wal: Arc<RedoLog>,
    dwb: Arc<DoubleWrite>,
    tm: Arc<TransactionManager>,
    pool: BufferPool,
    index: RwLock<BPlusTree>,
    locks: LockTable,
    /// The page new inserts are currently filling. Allocation strategy: fill
    /// the current page until full, then open a fresh one.
    fill_page: Mutex<Option<PageId>>,
    /// Highest LSN whose index effects are contained in the durable index
    /// blob. Truncation never discards records above it; reset to 0 on every
    /// restart, which merely delays truncation until the next quiesced
    /// checkpoint.
    index_anchor: AtomicU64,
}

impl Engine {
    /// Assembles the engine over `config.data_dir`. Call [`Engine::recover`]
    /// once before serving transactions.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let disk = Arc::new(DiskStore::open(&config.data_dir)?);
        let wal = Arc::new(RedoLog::open(disk.clone())?);
        let dwb = Arc::new(DoubleWrite::new(disk.clone()));
        let tm = Arc::new(TransactionManager::new());
        let pool = BufferPool::new(
            config.buffer_pool_size,
            disk.clone(),
            wal.clone(),
            dwb.clone(),
            tm.clone(),
        )?;
        let index = match disk.read_artifact(INDEX_ARTIFACT)? {
            Some(bytes) => BPlusTree::from_blob(&bytes)?,
            None => BPlusTree::new(config.bplustree_t),
        };
        Ok(Self {
            disk,
            wal,
            dwb,
            tm,
            pool,
            index: RwLock::new(index),
            locks: LockTable::new(),
            fill_page: Mutex::new(None),
            index_anchor: AtomicU64::new(0),
            config,
        })
    }

    pub fn begin(&self) -> Transaction {
        let tx = self.tm.begin();
        granite_debug_log!("[Engine] began tx {}", tx.txid());
        tx
    }

    pub fn insert(&self, tx: &mut Transaction, row: Row) -> Result<()> {
        self.ensure_active(tx)?;
        self.lock_row(tx, row.id)?;
        if self.index.read().get(row.id).is_some() {
            return Err(EngineError::DuplicateRowId(row.id));
        }

        let row_id = row.id;
        let page_id = self.place_row(tx, row, false, None)?;
        self.index.write().put(row_id, page_id);
        Ok(())
    }

    pub fn read(&self, tx: &mut Transaction, row_id: RowId) -> Result<Row> {
        self.ensure_active(tx)?;
        // reads take the same exclusive lock as writes
        self.lock_row(tx, row_id)?;
        let page_id = self.lookup(row_id)?;
        let guard = self.pool.fetch(page_id)?;
        let page = guard.read();
        match page.get(row_id) {
            Some(row) => Ok(row.clone()),
            None => panic!("row {row_id} is indexed to page {page_id} but absent from it"),
        }
    }

    pub fn update(&self, tx: &mut Transaction, row_id: RowId, row: Row) -> Result<()> {
        debug_assert_eq!(row.id, row_id, "replacement row keeps its id");
        self.ensure_active(tx)?;
        self.lock_row(tx, row_id)?;
        let page_id = self.lookup(row_id)?;
        let guard = self.pool.fetch(page_id)?;

        let mut page = guard.write();
        let before = match page.get(row_id) {
            Some(row) => row.clone(),
            None => panic!("row {row_id} is indexed to page {page_id} but absent from it"),
        };
        tx.undo.push(UndoRecord::Update { page_id, before });
        let lsn = self.wal.append(
            tx.txid(),
            false,
            RedoOp::Update {
                page_id,
                row: row.clone(),
            },
        );
        self.note_lsn(tx, page_id, lsn);
        page.upsert(row);
        page.lsn = lsn;
        Ok(())
    }

    pub fn delete(&self, tx: &mut Transaction, row_id: RowId) -> Result<()> {
        self.ensure_active(tx)?;
        self.lock_row(tx, row_id)?;
        let page_id = self.lookup(row_id)?;
        let guard = self.pool.fetch(page_id)?;

        {
            let mut page = guard.write();
            let before = match page.get(row_id) {
                Some(row) => row.clone(),
                None => panic!("row {row_id} is indexed to page {page_id} but absent from it"),
            };
            tx.undo.push(UndoRecord::Delete { page_id, before });
            let lsn = self
                .wal
                .append(tx.txid(), false, RedoOp::Delete { page_id, row_id });
            self.note_lsn(tx, page_id, lsn);
            page.remove_row(row_id);
            page.lsn = lsn;
        }
        self.index.write().delete(row_id);
        Ok(())
    }

    /// Makes the transaction durable: its records and a commit marker must
    /// be flushed before the commit is reported. A flush failure leaves the
    /// outcome to the next recovery (the marker either reached disk or did
    /// not) and the transaction is dropped as aborted.
    pub fn commit(&self, tx: &mut Transaction) -> Result<()> {
        self.ensure_active(tx)?;
        if !tx.is_read_only() {
            failpoint::maybe_fail("engine.commit.before_log")?;
            let lsn = self.wal.append(tx.txid(), false, RedoOp::Commit);
            tx.record_lsn(lsn);

            let flushed = self
                .wal
                .flush_through(tx.last_lsn)
                .and_then(|()| Ok(failpoint::maybe_fail("engine.commit.after_flush")?));
            if let Err(err) = flushed {
                self.finish(tx, TxState::Aborted);
                return Err(err);
            }
        }
        granite_debug_log!("[Engine] tx {} committed", tx.txid());
        self.finish(tx, TxState::Committed);
        Ok(())
    }

    /// Reverses the transaction's operations newest-first, logging a
    /// compensation record for each reversal so that a crash mid-rollback
    /// still converges at recovery. Rolling back an already aborted
    /// transaction is a no-op.
    pub fn rollback(&self, tx: &mut Transaction) -> Result<()> {
        match tx.state() {
            TxState::Aborted => return Ok(()),
            TxState::Committed => {
                return Err(EngineError::InvalidState(
                    "cannot roll back a committed transaction",
                ))
            }
            TxState::Active => {}
        }

        granite_debug_log!("[Engine] rolling back tx {}", tx.txid());
        let undo = std::mem::take(&mut tx.undo);
        for record in undo.into_iter().rev() {
            self.apply_undo(tx, record)?;
        }
        self.finish(tx, TxState::Aborted);
        Ok(())
    }

    /// Propagates every flushable dirty page to its final home through the
    /// double-write buffer, persists the index, and truncates the redo log
    /// to the earliest record still needed.
    pub fn checkpoint(&self) -> Result<()> {
        granite_debug_log!("[Engine] checkpoint started");
        let guards = self.pool.pin_dirty();
        // hold the read locks until the dirty flags clear, so a concurrent
        // writer can neither outrun the log flush nor slip a change between
        // the snapshot and the clear
        let pages: Vec<_> = guards.iter().map(|g| (g.page_id(), g.read())).collect();
        // redo before data: nothing may land in place until the log covers it
        self.wal.flush_through(self.wal.max_lsn())?;
        let batch: Vec<(PageId, Vec<u8>)> = pages
            .iter()
            .map(|(page_id, page)| (*page_id, codec::encode_page(page)))
            .collect();
        self.dwb.write_batch(&batch)?;

        // the index snapshot may only be persisted while no transaction is
        // in flight: an entry for an uncommitted row (or the absence of one
        // for an uncommitted delete) must never reach the durable blob,
        // since recovery has no undo phase to repair it. Holding the read
        // lock keeps transactions that slip past the check out of the blob.
        {
            let index = self.index.read();
            if self.tm.active_count() == 0 {
                self.disk.write_artifact(INDEX_ARTIFACT, &index.to_blob())?;
                self.disk.flush()?;
                self.index_anchor
                    .store(self.wal.flushed_lsn(), Ordering::SeqCst);
            }
        }

        for (page_id, _) in &pages {
            self.pool.clear_dirty(*page_id);
        }
        drop(pages);
        drop(guards);

        // keep everything an in-flight transaction may still commit, every
        // record a still-dirty page would need redone, and every index
        // change the durable index blob does not contain yet
        let mut cutoff = self.index_anchor.load(Ordering::SeqCst) + 1;
        if let Some(lsn) = self.tm.min_active_first_lsn() {
            cutoff = cutoff.min(lsn);
        }
        if let Some(lsn) = self.pool.min_dirty_rec_lsn() {
            cutoff = cutoff.min(lsn);
        }
        self.wal.truncate_below(cutoff)?;
        granite_debug_log!("[Engine] checkpoint done, log truncated below {cutoff}");
        Ok(())
    }

    /// Crash recovery. Run exactly once at startup, before any transaction:
    /// repair torn pages from the double-write buffer, then replay the redo
    /// log (records of committed transactions plus all compensations) onto
    /// any page whose image predates them. Idempotent.
    pub fn recover(&self) -> Result<()> {
        let repaired = self.dwb.recover()?;
        if repaired > 0 {
            granite_debug_log!("[Engine] recovery repaired {repaired} torn pages");
        }

        let records = self.wal.records();
        if records.is_empty() {
            return Ok(());
        }

        let committed: HashSet<TxId> = records
            .iter()
            .filter(|r| matches!(r.op, RedoOp::Commit))
            .map(|r| r.txid)
            .collect();

        let mut max_txid = 0;
        for record in &records {
            max_txid = max_txid.max(record.txid);
            if !record.compensation && !committed.contains(&record.txid) {
                continue;
            }
            let Some(page_id) = record.page_id() else {
                continue;
            };

            self.pool.note_page_id(page_id);
            let guard = self.pool.fetch_or_create(page_id)?;
            let mut page = guard.write();
            // the page image may already include this record (it reached
            // disk through a checkpoint); the index blob may still lag it
            match &record.op {
                RedoOp::Insert { row, .. } | RedoOp::Update { row, .. } => {
                    if record.lsn > page.lsn {
                        page.upsert(row.clone());
                        page.lsn = record.lsn;
                    }
                    self.index.write().put(row.id, page_id);
                }
                RedoOp::Delete { row_id, .. } => {
                    if record.lsn > page.lsn {
                        page.remove_row(*row_id);
                        page.lsn = record.lsn;
                    }
                    self.index.write().delete(*row_id);
                }
                RedoOp::Commit => unreachable!("commit records carry no page"),
            }
            drop(page);
            self.pool.record_write(page_id, record.txid, record.lsn);
        }

        self.tm.resume_after(max_txid);
        granite_debug_log!(
            "[Engine] recovery replayed {} records, {} committed transactions",
            records.len(),
            committed.len()
        );
        Ok(())
    }

    /// Orderly teardown: checkpoint, then release everything. A plain drop
    /// skips the checkpoint, which is exactly a crash.
    pub fn close(self) -> Result<()> {
        self.checkpoint()
    }

    pub fn active_transactions(&self) -> usize {
        self.tm.active_count()
    }

    fn ensure_active(&self, tx: &Transaction) -> Result<()> {
        if tx.state() != TxState::Active {
            return Err(EngineError::InvalidState("transaction is not active"));
        }
        Ok(())
    }

    fn lock_row(&self, tx: &mut Transaction, row_id: RowId) -> Result<()> {
        if tx.locks_held.contains(&row_id) {
            return Ok(());
        }
        self.locks
            .acquire(tx.txid(), row_id, self.config.lock_timeout)?;
        tx.locks_held.insert(row_id);
        Ok(())
    }

    fn lookup(&self, row_id: RowId) -> Result<PageId> {
        self.index
            .read()
            .get(row_id)
            .ok_or(EngineError::Missing(row_id))
    }

    fn note_lsn(&self, tx: &mut Transaction, page_id: PageId, lsn: Lsn) {
        tx.record_lsn(lsn);
        self.tm.record_lsn(tx.txid(), lsn);
        self.pool.record_write(page_id, tx.txid(), lsn);
    }

    /// Puts the row on a page with room (`preferred` first, then the fill
    /// page, then a fresh allocation), logging before mutating. Returns the
    /// page that took the row.
    fn place_row(
        &self,
        tx: &mut Transaction,
        mut row: Row,
        compensation: bool,
        mut preferred: Option<PageId>,
    ) -> Result<PageId> {
        loop {
            let guard = self.page_with_room(preferred.take())?;
            match self.try_append_row(tx, &guard, row, compensation) {
                Ok(()) => return Ok(guard.page_id()),
                // the page filled up between selection and the write lock
                Err(back) => row = back,
            }
        }
    }

    fn page_with_room(&self, preferred: Option<PageId>) -> Result<PageGuard<'_>> {
        if let Some(page_id) = preferred {
            let guard = self.pool.fetch(page_id)?;
            if guard.read().len() < self.config.page_capacity {
                return Ok(guard);
            }
        }

        let mut fill_page = self.fill_page.lock();
        if let Some(page_id) = *fill_page {
            let guard = self.pool.fetch(page_id)?;
            if guard.read().len() < self.config.page_capacity {
                return Ok(guard);
            }
        }
        let guard = self.pool.allocate()?;
        *fill_page = Some(guard.page_id());
        Ok(guard)
    }

    /// Logs and applies the append under one page write lock, or hands the
    /// row back when the page turned out to be full after all.
    fn try_append_row(
        &self,
        tx: &mut Transaction,
        guard: &PageGuard<'_>,
        row: Row,
        compensation: bool,
    ) -> std::result::Result<(), Row> {
        let mut page = guard.write();
        if page.len() >= self.config.page_capacity {
            return Err(row);
        }

        if !compensation {
            tx.undo.push(UndoRecord::Insert { row_id: row.id });
        }
        let page_id = guard.page_id();
        let lsn = self.wal.append(
            tx.txid(),
            compensation,
            RedoOp::Insert {
                page_id,
                row: row.clone(),
            },
        );
        self.note_lsn(tx, page_id, lsn);
        page.push_row(row);
        page.lsn = lsn;
        Ok(())
    }

    fn apply_undo(&self, tx: &mut Transaction, record: UndoRecord) -> Result<()> {
        match record {
            UndoRecord::Insert { row_id } => {
                let page_id = match self.index.read().get(row_id) {
                    Some(page_id) => page_id,
                    None => panic!("undoing an insert of row {row_id} with no index entry"),
                };
                let guard = self.pool.fetch(page_id)?;
                {
                    let mut page = guard.write();
                    let lsn =
                        self.wal
                            .append(tx.txid(), true, RedoOp::Delete { page_id, row_id });
                    self.note_lsn(tx, page_id, lsn);
                    page.remove_row(row_id);
                    page.lsn = lsn;
                }
                self.index.write().delete(row_id);
            }
            UndoRecord::Update { page_id, before } => {
                let guard = self.pool.fetch(page_id)?;
                let mut page = guard.write();
                let lsn = self.wal.append(
                    tx.txid(),
                    true,
                    RedoOp::Update {
                        page_id,
                        row: before.clone(),
                    },
                );
                self.note_lsn(tx, page_id, lsn);
                page.upsert(before);
                page.lsn = lsn;
            }
            UndoRecord::Delete { page_id, before } => {
                let row_id = before.id;
                let landed = self.place_row(tx, before, true, Some(page_id))?;
                self.index.write().put(row_id, landed);
            }
        }
        Ok(())
    }

    /// Ends the transaction: terminal state, deregistration, and the single
    /// shrinking-phase lock release.
    fn finish(&self, tx: &mut Transaction, state: TxState) {
        tx.set_state(state);
        self.tm.finish(tx.txid());
        self.locks.release_all(tx.txid());
        tx.locks_held.clear();
        tx.undo.clear();
    }
}
