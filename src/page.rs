use serde::{Deserialize, Serialize};

use crate::wal::Lsn;
use crate::{PageId, RowId};

/// A single row. The payload is opaque to the engine; only the id is
/// interpreted. Rows are never split across pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub payload: Vec<u8>,
}

impl Row {
    pub fn new(id: RowId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}

/// A fixed-capacity container of rows, the unit of caching and disk I/O.
///
/// `lsn` is the LSN of the latest redo record applied to this in-memory
/// image; recovery uses it to decide whether a record still needs replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub page_id: PageId,
    pub lsn: Lsn,
    rows: Vec<Row>,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            lsn: 0,
            rows: Vec::new(),
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, row_id: RowId) -> Option<&Row> {
        self.rows.iter().find(|r| r.id == row_id)
    }

    /// Appends a row. The caller has already checked capacity and uniqueness.
    pub fn push_row(&mut self, row: Row) {
        debug_assert!(self.get(row.id).is_none(), "duplicate row on page");
        self.rows.push(row);
    }

    /// Replaces a row in place when present, appends otherwise.
    /// Returns the previous image.
    pub fn upsert(&mut self, row: Row) -> Option<Row> {
        match self.rows.iter_mut().find(|r| r.id == row.id) {
            Some(slot) => Some(std::mem::replace(slot, row)),
            None => {
                self.rows.push(row);
                None
            }
        }
    }

    /// Removes a row, preserving the insertion order of the rest.
    /// Freed capacity is reclaimed in place by later inserts.
    pub fn remove_row(&mut self, row_id: RowId) -> Option<Row> {
        let pos = self.rows.iter().position(|r| r.id == row_id)?;
        Some(self.rows.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_get_preserve_insertion_order() {
        let mut page = Page::new(1);
        page.push_row(Row::new(3, b"c".to_vec()));
        page.push_row(Row::new(1, b"a".to_vec()));
        page.push_row(Row::new(2, b"b".to_vec()));

        assert_eq!(page.len(), 3);
        assert_eq!(page.get(1).unwrap().payload, b"a");
        let ids: Vec<_> = page.rows().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn upsert_replaces_in_place_and_returns_before_image() {
        let mut page = Page::new(1);
        page.push_row(Row::new(1, b"old".to_vec()));
        page.push_row(Row::new(2, b"x".to_vec()));

        let before = page.upsert(Row::new(1, b"new".to_vec())).unwrap();
        assert_eq!(before.payload, b"old");
        assert_eq!(page.rows()[0].payload, b"new");

        assert!(page.upsert(Row::new(3, b"y".to_vec())).is_none());
        assert_eq!(page.len(), 3);
    }

    #[test]
    fn remove_keeps_remaining_rows_ordered() {
        let mut page = Page::new(1);
        for id in 1..=4 {
            page.push_row(Row::new(id, vec![id as u8]));
        }

        let removed = page.remove_row(2).unwrap();
        assert_eq!(removed.id, 2);
        assert!(page.remove_row(2).is_none());
        let ids: Vec<_> = page.rows().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
    }
}
