//! The buffer pool: a bounded cache of pages with pinning, dirty tracking,
//! and least-recently-used eviction.
//!
//! One mutex guards the frame table, the LRU list, and the pin/dirty
//! metadata; page contents sit behind per-frame read-write locks reached
//! through RAII guards. In-place page writes follow a no-steal policy: a
//! frame still dirtied by an in-flight transaction is neither evicted nor
//! checkpointed, which is what lets recovery skip an undo phase entirely.
//! A dirty victim goes through the write-ahead flush path (redo log first,
//! then the double-write batch) before its frame is reused.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec;
use crate::disk::DiskStore;
use crate::dwb::DoubleWrite;
use crate::error::{EngineError, Result};
use crate::granite_debug_log;
use crate::page::Page;
use crate::transaction::TransactionManager;
use crate::wal::{Lsn, RedoLog};
use crate::{PageId, TxId};

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Frame {
    page_id: PageId,
    page: Arc<RwLock<Page>>,
    pin_count: u32,
    dirty: bool,
    /// Transactions that wrote this page since it was last clean. The frame
    /// may reach disk only once none of them is still active.
    dirtiers: HashSet<TxId>,
    /// LSN of the first record applied since the frame was last clean;
    /// bounds redo log truncation while the frame stays dirty.
    rec_lsn: Lsn,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
struct PoolInner {
    frames: Vec<Option<Frame>>,
    page_table: HashMap<PageId, usize>,
    free: Vec<usize>,
    /// Most recently used end of the intrusive LRU list.
    head: usize,
    /// Least recently used end, where victim scans start.
    tail: usize,
}

#[derive(Debug)]
pub struct BufferPool {
    disk: Arc<DiskStore>,
    wal: Arc<RedoLog>,
    dwb: Arc<DoubleWrite>,
    tm: Arc<TransactionManager>,
    inner: Mutex<PoolInner>,
    next_page_id: AtomicU64,
}

/// A pinned page. `read` for lookups, `write` for mutation (which marks the
/// frame dirty). Dropping the guard unpins on every exit path.
#[derive(Debug)]
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    page: Arc<RwLock<Page>>,
}

impl PageGuard<'_> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        // mark after acquiring: a writer queued behind a checkpoint must not
        // have its dirty flag cleared out from under it
        let guard = self.page.write();
        self.pool.mark_dirty(self.page_id);
        guard
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin(self.page_id);
    }
}

impl BufferPool {
    pub fn new(
        capacity: usize,
        disk: Arc<DiskStore>,
        wal: Arc<RedoLog>,
        dwb: Arc<DoubleWrite>,
        tm: Arc<TransactionManager>,
    ) -> Result<Self> {
        assert!(capacity > 0, "buffer pool needs at least one frame");
        let next_page_id = disk.enumerate()?.last().map(|&id| id + 1).unwrap_or(1);
        let mut frames = Vec::with_capacity(capacity);
        frames.resize_with(capacity, || None);
        Ok(Self {
            disk,
            wal,
            dwb,
            tm,
            inner: Mutex::new(PoolInner {
                frames,
                page_table: HashMap::new(),
                free: (0..capacity).collect(),
                head: NIL,
                tail: NIL,
            }),
            next_page_id: AtomicU64::new(next_page_id),
        })
    }

    /// Pins the page, loading it from the disk store on a miss. A missing
    /// blob is an invariant failure here; recovery uses `fetch_or_create`.
    pub fn fetch(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        self.fetch_inner(page_id, false)
    }

    /// Like `fetch`, but a page with no blob yet materializes empty.
    pub fn fetch_or_create(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        self.fetch_inner(page_id, true)
    }

    /// Creates a fresh page under a new monotone id, pinned and dirty.
    pub fn allocate(&self) -> Result<PageGuard<'_>> {
        let mut inner = self.inner.lock();
        let slot = self.take_frame(&mut inner)?;
        let page_id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        granite_debug_log!("[BufferPool] allocating page {page_id}");
        Ok(self.install(&mut inner, slot, Page::new(page_id), true))
    }

    /// Records that `txid` applied the record at `lsn` to the page. Called
    /// by the engine right after each logged mutation.
    pub fn record_write(&self, page_id: PageId, txid: TxId, lsn: Lsn) {
        let mut inner = self.inner.lock();
        let slot = *inner
            .page_table
            .get(&page_id)
            .expect("written page is resident");
        let frame = inner.frame_mut(slot);
        frame.dirtiers.insert(txid);
        if frame.rec_lsn == 0 {
            frame.rec_lsn = lsn;
        }
    }

    /// Pins every flushable dirty frame and returns its guard, ascending by
    /// page id. The checkpoint holds these for the duration of the batch
    /// write. Frames still dirtied by an active transaction stay behind.
    pub fn pin_dirty(&self) -> Vec<PageGuard<'_>> {
        let mut inner = self.inner.lock();
        let mut dirty: Vec<usize> = inner
            .page_table
            .values()
            .copied()
            .filter(|&slot| {
                let frame = inner.frame(slot);
                frame.dirty && !self.tm.any_active(&frame.dirtiers)
            })
            .collect();
        dirty.sort_unstable_by_key(|&slot| inner.frame(slot).page_id);

        dirty
            .into_iter()
            .map(|slot| {
                let frame = inner.frame_mut(slot);
                frame.pin_count += 1;
                PageGuard {
                    pool: self,
                    page_id: frame.page_id,
                    page: frame.page.clone(),
                }
            })
            .collect()
    }

    pub fn clear_dirty(&self, page_id: PageId) {
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.page_table.get(&page_id) {
            let frame = inner.frame_mut(slot);
            frame.dirty = false;
            frame.dirtiers.clear();
            frame.rec_lsn = 0;
        }
    }

    /// The earliest LSN still needed to redo a page that has not reached
    /// disk yet. Bounds checkpoint truncation.
    pub fn min_dirty_rec_lsn(&self) -> Option<Lsn> {
        let inner = self.inner.lock();
        inner
            .page_table
            .values()
            .filter_map(|&slot| {
                let frame = inner.frame(slot);
                (frame.dirty && frame.rec_lsn != 0).then_some(frame.rec_lsn)
            })
            .min()
    }

    pub fn is_cached(&self, page_id: PageId) -> bool {
        self.inner.lock().page_table.contains_key(&page_id)
    }

    /// Raises the allocation watermark; recovery feeds it the page ids it
    /// sees in the log so later allocations cannot collide.
    pub fn note_page_id(&self, page_id: PageId) {
        self.next_page_id.fetch_max(page_id + 1, Ordering::SeqCst);
    }

    fn fetch_inner(&self, page_id: PageId, create_missing: bool) -> Result<PageGuard<'_>> {
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.page_table.get(&page_id) {
            inner.detach(slot);
            inner.push_front(slot);
            let frame = inner.frame_mut(slot);
            frame.pin_count += 1;
            return Ok(PageGuard {
                pool: self,
                page_id,
                page: frame.page.clone(),
            });
        }

        let slot = self.take_frame(&mut inner)?;
        let loaded = match self.disk.read_page(page_id) {
            Ok(Some(bytes)) => codec::decode_page(page_id, &bytes),
            Ok(None) if create_missing => Ok(Page::new(page_id)),
            Ok(None) => Err(EngineError::PageMissing(page_id)),
            Err(err) => Err(err.into()),
        };
        let page = match loaded {
            Ok(page) => page,
            Err(err) => {
                inner.free.push(slot);
                return Err(err);
            }
        };
        Ok(self.install(&mut inner, slot, page, false))
    }

    /// Finds a reusable slot: the free list first, then a victim scan from
    /// the LRU end. Pinned frames and frames dirtied by an in-flight
    /// transaction are skipped; when nothing is evictable the pool is
    /// exhausted.
    fn take_frame(&self, inner: &mut PoolInner) -> Result<usize> {
        if let Some(slot) = inner.free.pop() {
            return Ok(slot);
        }

        let mut slot = inner.tail;
        while slot != NIL {
            let frame = inner.frame(slot);
            if frame.pin_count == 0 && !(frame.dirty && self.tm.any_active(&frame.dirtiers)) {
                break;
            }
            slot = frame.prev;
        }
        if slot == NIL {
            return Err(EngineError::BufferExhausted);
        }

        self.evict(inner, slot)?;
        Ok(slot)
    }

    /// Drops a frame from the pool, flushing a dirty page first: the redo
    /// log must be durable through the page's LSN before the image may land
    /// in place, and the landing itself goes through the double-write batch.
    fn evict(&self, inner: &mut PoolInner, slot: usize) -> Result<()> {
        let (page_id, dirty) = {
            let frame = inner.frame(slot);
            (frame.page_id, frame.dirty)
        };
        if dirty {
            granite_debug_log!("[BufferPool] flushing page {page_id} before eviction");
            let (lsn, bytes) = {
                let page = inner.frame(slot).page.read();
                (page.lsn, codec::encode_page(&page))
            };
            self.wal.flush_through(lsn)?;
            self.dwb.write_batch(&[(page_id, bytes)])?;
        }

        inner.detach(slot);
        inner.page_table.remove(&page_id);
        inner.frames[slot] = None;
        Ok(())
    }

    fn install(
        &self,
        inner: &mut PoolInner,
        slot: usize,
        page: Page,
        dirty: bool,
    ) -> PageGuard<'_> {
        let page_id = page.page_id;
        let page = Arc::new(RwLock::new(page));
        inner.frames[slot] = Some(Frame {
            page_id,
            page: page.clone(),
            pin_count: 1,
            dirty,
            dirtiers: HashSet::new(),
            rec_lsn: 0,
            prev: NIL,
            next: NIL,
        });
        inner.push_front(slot);
        inner.page_table.insert(page_id, slot);
        PageGuard {
            pool: self,
            page_id,
            page,
        }
    }

    fn mark_dirty(&self, page_id: PageId) {
        let mut inner = self.inner.lock();
        let slot = *inner
            .page_table
            .get(&page_id)
            .expect("dirtied page is resident");
        inner.frame_mut(slot).dirty = true;
    }

    fn unpin(&self, page_id: PageId) {
        let mut inner = self.inner.lock();
        let slot = *inner
            .page_table
            .get(&page_id)
            .expect("unpinned page is resident");
        let frame = inner.frame_mut(slot);
        assert!(frame.pin_count > 0, "unbalanced unpin of page {page_id}");
        frame.pin_count -= 1;
    }
}

impl PoolInner {
    fn frame(&self, slot: usize) -> &Frame {
        self.frames[slot].as_ref().expect("frame slot is occupied")
    }

    fn frame_mut(&mut self, slot: usize) -> &mut Frame {
        self.frames[slot].as_mut().expect("frame slot is occupied")
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = {
            let frame = self.frame(slot);
            (frame.prev, frame.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.frame_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.frame_mut(next).prev = prev;
        }
        let frame = self.frame_mut(slot);
        frame.prev = NIL;
        frame.next = NIL;
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let frame = self.frame_mut(slot);
            frame.prev = NIL;
            frame.next = old_head;
        }
        if old_head == NIL {
            self.tail = slot;
        } else {
            self.frame_mut(old_head).prev = slot;
        }
        self.head = slot;
    }
}
