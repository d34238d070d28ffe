//! The double-write buffer.
//!
//! Page blobs are atomic individually, but a checkpoint writes many of them;
//! a crash in the middle leaves a mix of old and new images. The batch is
//! therefore staged as one `dwb` blob first: once that blob is durable, the
//! in-place writes may proceed in any order, because recovery can always
//! re-apply the complete staged batch.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::codec;
use crate::disk::{DiskStore, DWB_ARTIFACT};
use crate::error::Result;
use crate::failpoint;
use crate::granite_debug_log;
use crate::PageId;

type StagedBatch = Vec<(PageId, Vec<u8>)>;

#[derive(Debug)]
pub struct DoubleWrite {
    disk: Arc<DiskStore>,
    /// There is one staging area; overlapping batches (a checkpoint and a
    /// concurrent eviction) must take turns or a crash could find a stage
    /// that no longer covers the batch in flight.
    stage: Mutex<()>,
}

impl DoubleWrite {
    pub fn new(disk: Arc<DiskStore>) -> Self {
        Self {
            disk,
            stage: Mutex::new(()),
        }
    }

    /// The only path that moves page images to their final homes: stage the
    /// whole batch, flush, write each page in place, flush, clear the stage.
    pub fn write_batch(&self, batch: &[(PageId, Vec<u8>)]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let _stage = self.stage.lock();
        self.disk
            .write_artifact(DWB_ARTIFACT, &codec::encode_artifact(batch))?;
        self.disk.flush()?;

        failpoint::maybe_fail("dwb.before_inplace")?;
        for (applied, (page_id, image)) in batch.iter().enumerate() {
            if applied > 0 {
                failpoint::maybe_fail("dwb.mid_inplace")?;
            }
            self.disk.write_page(*page_id, image)?;
        }
        self.disk.flush()?;

        failpoint::maybe_fail("dwb.before_clear")?;
        self.clear()
    }

    /// Startup repair: a non-empty stage means a prior batch may have torn;
    /// re-apply every staged image, then clear. Returns how many pages were
    /// restored.
    pub fn recover(&self) -> Result<usize> {
        let _stage = self.stage.lock();
        let Some(bytes) = self.disk.read_artifact(DWB_ARTIFACT)? else {
            return Ok(0);
        };
        let staged: StagedBatch = codec::decode_artifact(DWB_ARTIFACT, &bytes)?;
        if staged.is_empty() {
            return Ok(0);
        }

        granite_debug_log!("[DoubleWrite] restoring {} staged pages", staged.len());
        for (page_id, image) in &staged {
            self.disk.write_page(*page_id, image)?;
        }
        self.disk.flush()?;
        self.clear()?;
        Ok(staged.len())
    }

    fn clear(&self) -> Result<()> {
        let empty: StagedBatch = Vec::new();
        self.disk
            .write_artifact(DWB_ARTIFACT, &codec::encode_artifact(&empty))?;
        self.disk.flush()?;
        Ok(())
    }
}
