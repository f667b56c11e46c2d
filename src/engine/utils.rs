//! Engine utilities: the record type shared by every layer.
//!
//! [`PointEntry`] is the common currency between the memtable (flush
//! source), the SSTable writer and reader, and the compaction merge.

use crate::key::HexKey;

// ------------------------------------------------------------------------------------------------
// PointEntry
// ------------------------------------------------------------------------------------------------

/// A single key with either a live value or a deletion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointEntry {
    /// Key of the entry.
    pub key: Vec<u8>,

    /// Value of the entry; `None` is a tombstone.
    pub value: Option<Vec<u8>>,
}

impl PointEntry {
    /// Creates a live entry.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Creates a tombstone.
    pub fn new_delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// `true` when this entry marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

impl std::fmt::Display for PointEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "put({}, {} bytes)", HexKey(&self.key), value.len()),
            None => write!(f, "delete({})", HexKey(&self.key)),
        }
    }
}
