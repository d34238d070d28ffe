//! Per-transaction undo records.
//!
//! Appended in operation order, applied in reverse on rollback, discarded on
//! commit. Undo never reaches the durable log: a crashed transaction left no
//! commit marker, so redo replay skips its work and nothing needs undoing
//! after restart.

use crate::page::Row;
use crate::{PageId, RowId};

/// The inverse of one operation, holding whatever image reversal needs.
#[derive(Debug, Clone)]
pub enum UndoRecord {
    /// Reverses an insert by deleting the row again.
    Insert { row_id: RowId },
    /// Reverses an update by restoring the before-image in place.
    Update { page_id: PageId, before: Row },
    /// Reverses a delete by reinserting the before-image. `page_id` is the
    /// page the row lived on, preferred when it still has room.
    Delete { page_id: PageId, before: Row },
}
