//! # Memtable Module
//!
//! The mutable, sorted, in-memory write buffer of the engine.
//!
//! A `Memtable` wraps a [`SkipList`] whose values are `Option<Vec<u8>>`:
//! `Some` is a live value and `None` a tombstone. Deletes write a
//! tombstone instead of unlinking the key so that an older value held in
//! an SSTable stays shadowed after the memtable is flushed.
//!
//! ## Concurrency
//!
//! All synchronization lives in the skip list's `RwLock`. Size accounting
//! uses an atomic counter, so `approximate_size()` never takes the lock.
//!
//! ## Lifecycle
//!
//! The engine writes into one active memtable. Once it crosses the size
//! or entry-count threshold it is frozen (no more writes are routed to
//! it), drained with [`Memtable::iter_for_flush`], written to an SSTable
//! and dropped.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


pub mod skiplist;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tracing::trace;

use crate::engine::utils::PointEntry;
use crate::key::HexKey;
pub use skiplist::{SkipList, SkipListConfig};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Fixed per-entry cost added to key and value bytes in size accounting.
pub const ENTRY_OVERHEAD: usize = 32;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Represents possible errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outcome of a memtable point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableGetResult {
    /// The key holds a live value.
    Put(Vec<u8>),

    /// The key was deleted in this memtable.
    Delete,

    /// The memtable knows nothing about the key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// An in-memory sorted key-value buffer.
pub struct Memtable {
    /// Sorted storage; `None` values are tombstones.
    list: SkipList<Option<Vec<u8>>>,

    /// Approximate bytes held: key + value + [`ENTRY_OVERHEAD`] per entry.
    approximate_size: AtomicUsize,
}

fn entry_size(key_len: usize, value: Option<&[u8]>) -> usize {
    key_len + value.map_or(0, <[u8]>::len) + ENTRY_OVERHEAD
}

impl Memtable {
    /// Creates an empty memtable.
    pub fn new(config: SkipListConfig) -> Self {
        Self {
            list: SkipList::new(config),
            approximate_size: AtomicUsize::new(0),
        }
    }

    fn apply(&self, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<(), MemtableError> {
        let key_len = key.len();
        let added = entry_size(key_len, value.as_deref());

        let replaced = self.list.set(key, value)?;

        self.approximate_size.fetch_add(added, Ordering::Relaxed);
        if let Some(old) = replaced {
            self.approximate_size
                .fetch_sub(entry_size(key_len, old.as_deref()), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Inserts or overwrites a key.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MemtableError> {
        trace!(key = %HexKey(&key), value_len = value.len(), "memtable put");
        self.apply(key, Some(value))
    }

    /// Records a tombstone for `key`.
    pub fn delete(&self, key: Vec<u8>) -> Result<(), MemtableError> {
        trace!(key = %HexKey(&key), "memtable delete");
        self.apply(key, None)
    }

    /// Looks up the latest state of `key` in this memtable.
    pub fn get(&self, key: &[u8]) -> Result<MemtableGetResult, MemtableError> {
        Ok(match self.list.get(key)? {
            Some(Some(value)) => MemtableGetResult::Put(value),
            Some(None) => MemtableGetResult::Delete,
            None => MemtableGetResult::NotFound,
        })
    }

    /// Returns every entry, tombstones included, in ascending key order.
    pub fn iter_for_flush(&self) -> Result<Vec<PointEntry>, MemtableError> {
        Ok(self
            .list
            .iter()?
            .map(|(key, value)| PointEntry { key, value })
            .collect())
    }

    /// Approximate number of bytes buffered.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// Number of distinct keys, tombstones included.
    pub fn len(&self) -> Result<usize, MemtableError> {
        self.list.len()
    }

    /// `true` when nothing has been written.
    pub fn is_empty(&self) -> Result<bool, MemtableError> {
        self.list.is_empty()
    }
}
