//! The write-ahead redo log.
//!
//! One process-wide sequence of records with strictly increasing LSNs,
//! buffered in memory and made durable as a single checksummed blob. A
//! modification may reach its in-place page only once the log is durable
//! past the record that describes it; both in-place writers (checkpoint and
//! dirty eviction) flush the log first.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::disk::{DiskStore, REDO_LOG_ARTIFACT};
use crate::error::{EngineError, Result};
use crate::failpoint;
use crate::page::Row;
use crate::{PageId, RowId, TxId};

/// A Log Sequence Number. 0 means "none"; the first record gets LSN 1.
pub type Lsn = u64;

/// The logged effect of one page modification, or a commit marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RedoOp {
    /// A row was added to a page.
    Insert { page_id: PageId, row: Row },
    /// A row on a page was overwritten with a new image.
    Update { page_id: PageId, row: Row },
    /// A row was removed from a page.
    Delete { page_id: PageId, row_id: RowId },
    /// The transaction committed; everything before this LSN is its work.
    Commit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedoRecord {
    pub lsn: Lsn,
    pub txid: TxId,
    /// Compensation records are emitted during rollback and replayed
    /// regardless of whether the transaction committed.
    pub compensation: bool,
    pub op: RedoOp,
}

impl RedoRecord {
    pub fn page_id(&self) -> Option<PageId> {
        match self.op {
            RedoOp::Insert { page_id, .. }
            | RedoOp::Update { page_id, .. }
            | RedoOp::Delete { page_id, .. } => Some(page_id),
            RedoOp::Commit => None,
        }
    }
}

/// The durable form: the record sequence plus the LSN watermark. The
/// watermark keeps LSN assignment monotone across restarts even after
/// truncation empties the sequence; page images on disk are stamped with
/// old LSNs, and a reused LSN would defeat the replay gate.
#[derive(Debug, Serialize, Deserialize)]
struct LogBlob {
    next_lsn: Lsn,
    records: Vec<RedoRecord>,
}

#[derive(Debug, Default)]
struct RedoLogState {
    records: Vec<RedoRecord>,
    flushed_lsn: Lsn,
}

#[derive(Debug)]
pub struct RedoLog {
    disk: Arc<DiskStore>,
    state: Mutex<RedoLogState>,
    next_lsn: AtomicU64,
}

impl RedoLog {
    /// Opens the log, validating and loading any persisted records. LSN
    /// assignment resumes from the persisted watermark, never reusing an
    /// LSN that may already stamp a page on disk. (LSNs assigned but never
    /// flushed are safe to reuse: the WAL rule kept any page bearing them
    /// from reaching disk.)
    pub fn open(disk: Arc<DiskStore>) -> Result<Self> {
        let (next_lsn, records) = match disk.read_artifact(REDO_LOG_ARTIFACT)? {
            Some(bytes) => {
                let blob = decode_log_blob(&bytes)?;
                (blob.next_lsn, blob.records)
            }
            None => (1, Vec::new()),
        };
        Ok(Self {
            disk,
            next_lsn: AtomicU64::new(next_lsn),
            state: Mutex::new(RedoLogState {
                records,
                flushed_lsn: next_lsn - 1,
            }),
        })
    }

    /// Appends a record, assigning the next LSN.
    pub fn append(&self, txid: TxId, compensation: bool, op: RedoOp) -> Lsn {
        let mut state = self.state.lock();
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        state.records.push(RedoRecord {
            lsn,
            txid,
            compensation,
            op,
        });
        lsn
    }

    /// Makes every record with LSN <= `lsn` durable. A no-op when the log is
    /// already flushed that far.
    pub fn flush_through(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if state.flushed_lsn >= lsn {
            return Ok(());
        }
        failpoint::maybe_fail("wal.flush")?;
        // appends hold the state lock, so the counter is stable here
        let next_lsn = self.next_lsn.load(Ordering::SeqCst);
        self.disk.write_artifact(
            REDO_LOG_ARTIFACT,
            &encode_log_blob(next_lsn, &state.records),
        )?;
        self.disk.flush()?;
        state.flushed_lsn = next_lsn - 1;
        Ok(())
    }

    /// A snapshot of the buffered records in LSN order, for replay.
    pub fn records(&self) -> Vec<RedoRecord> {
        self.state.lock().records.clone()
    }

    /// Drops every record with LSN below `cutoff` and rewrites the blob.
    pub fn truncate_below(&self, cutoff: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        state.records.retain(|r| r.lsn >= cutoff);
        let next_lsn = self.next_lsn.load(Ordering::SeqCst);
        self.disk.write_artifact(
            REDO_LOG_ARTIFACT,
            &encode_log_blob(next_lsn, &state.records),
        )?;
        self.disk.flush()?;
        Ok(())
    }

    /// The highest LSN assigned so far (0 when the log is empty).
    pub fn max_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst) - 1
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed_lsn
    }

    /// The number of buffered records, flushed or not.
    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }
}

fn encode_log_blob(next_lsn: Lsn, records: &[RedoRecord]) -> Vec<u8> {
    let blob = LogBlob {
        next_lsn,
        records: records.to_vec(),
    };
    let payload = bincode::serialize(&blob).expect("record serialization is infallible");
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    let mut framed = hasher.finalize().to_le_bytes().to_vec();
    framed.extend_from_slice(&payload);
    framed
}

fn decode_log_blob(bytes: &[u8]) -> Result<LogBlob> {
    if bytes.len() < 4 {
        return Err(EngineError::CorruptLog(
            "blob shorter than its checksum".into(),
        ));
    }
    let (crc_bytes, payload) = bytes.split_at(4);
    let expected = u32::from_le_bytes(crc_bytes.try_into().expect("4-byte checksum"));
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != expected {
        return Err(EngineError::CorruptLog("checksum mismatch".into()));
    }
    let blob: LogBlob =
        bincode::deserialize(payload).map_err(|err| EngineError::CorruptLog(err.to_string()))?;
    if blob.next_lsn <= blob.records.last().map(|r| r.lsn).unwrap_or(0) {
        return Err(EngineError::CorruptLog("watermark behind its records".into()));
    }
    Ok(blob)
}
