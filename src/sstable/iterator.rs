//! Forward iteration over an SSTable.
//!
//! [`TableIterator`] walks the index in order and decodes one record per
//! step. Framing and checksums were verified when the table was opened, so
//! the only failure left at this point is a codec error while decoding a
//! value. Errors are yielded as items; the iterator is fused after the
//! first one.

use crate::engine::utils::PointEntry;
use crate::key::KeyOrder;

use super::{SSTable, SSTableError};

/// Sorted cursor over every record of one [`SSTable`].
pub struct TableIterator<'a, O: KeyOrder> {
    table: &'a SSTable<O>,
    next: usize,
    failed: bool,
}

impl<'a, O: KeyOrder> TableIterator<'a, O> {
    pub(crate) fn new(table: &'a SSTable<O>) -> Self {
        Self {
            table,
            next: 0,
            failed: false,
        }
    }

    fn decode(&self, j: usize) -> Result<PointEntry, SSTableError> {
        let record = self.table.record(j)?;
        let value = if record.tombstone {
            None
        } else {
            Some(self.table.decode_value(&record)?)
        };
        Ok(PointEntry {
            key: record.key.to_vec(),
            value,
        })
    }
}

impl<O: KeyOrder> Iterator for TableIterator<'_, O> {
    type Item = Result<PointEntry, SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.table.len() {
            return None;
        }
        let item = self.decode(self.next);
        self.next += 1;
        self.failed = item.is_err();
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            return (0, Some(0));
        }
        let remaining = self.table.len().saturating_sub(self.next);
        (0, Some(remaining))
    }
}
