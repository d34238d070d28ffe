use std::fmt;
use std::io;

use crate::{PageId, RowId};

/// The canonical error type for engine operations.
///
/// Nothing is recovered internally; every error surfaces to the transaction
/// owner. `DuplicateRowId` and `Missing` leave the transaction usable, the
/// rest expect the caller to roll back.
#[derive(Debug)]
pub enum EngineError {
    /// Insert of a row id that already exists.
    DuplicateRowId(RowId),
    /// Read, update, or delete of an absent row id.
    Missing(RowId),
    /// A lock wait exceeded the configured timeout.
    LockTimeout(RowId),
    /// Every buffer pool frame is pinned.
    BufferExhausted,
    /// An I/O failure in the blob store.
    Io(io::Error),
    /// The redo log (or another persisted artifact) failed validation at
    /// startup. Fatal: the engine refuses to start.
    CorruptLog(String),
    /// A page blob failed to decode. Fatal at recovery.
    CorruptPage(PageId),
    /// An indexed page has no blob on disk.
    PageMissing(PageId),
    /// An operation was attempted on a transaction in the wrong state.
    InvalidState(&'static str),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::DuplicateRowId(row_id) => write!(f, "row {row_id} already exists"),
            EngineError::Missing(row_id) => write!(f, "row {row_id} not found"),
            EngineError::LockTimeout(row_id) => {
                write!(f, "timed out waiting for lock on row {row_id}")
            }
            EngineError::BufferExhausted => write!(f, "all buffer pool frames are pinned"),
            EngineError::Io(err) => write!(f, "io error: {err}"),
            EngineError::CorruptLog(msg) => write!(f, "corrupt redo log: {msg}"),
            EngineError::CorruptPage(page_id) => write!(f, "corrupt page {page_id}"),
            EngineError::PageMissing(page_id) => write!(f, "page {page_id} not found on disk"),
            EngineError::InvalidState(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
