//! # LSM Storage Engine
//!
//! This module ties the memtable, SSTable and compaction layers into a
//! **synchronous** LSM-tree storage engine with point tombstones and
//! size-tiered compaction.
//!
//! ## Design Overview
//!
//! The engine organises data across three layers, queried newest-first:
//!
//! 1. **Active memtable**: an in-memory sorted skip list absorbing writes.
//! 2. **Frozen memtables**: read-only memtables awaiting flush.
//! 3. **SSTables**: immutable, sorted, on-disk files with bloom filters.
//!
//! When the active memtable reaches [`EngineConfig::write_buffer_size`] or
//! [`EngineConfig::max_memtable_entries`] it is frozen and a fresh memtable
//! takes its place. Frozen memtables are flushed to SSTables via
//! [`Engine::flush_oldest_frozen`] / [`Engine::flush_all_frozen`].
//!
//! ## Table Set
//!
//! SSTables live in `<root>/sstables/` and are named `{lo:06}-{hi:06}.sst`.
//! A flush allocates a fresh id `n` and writes `n-n`; a compaction of a
//! run spanning ids `lo..=hi` writes `lo-hi`. The table set is ordered by
//! `hi`, oldest first, so the name alone fixes a table's recency.
//!
//! ## Concurrency Model
//!
//! State is split across three locks, always taken in this order:
//!
//! 1. `active`: writers hold a **read** lock while writing into the
//!    memtable (the skip list has its own lock); freezing takes the
//!    **write** lock, so no write can land in a memtable once frozen.
//! 2. `frozen`
//! 3. `tables`
//!
//! Readers take all three read locks together and clone a `ReadView`, so
//! they see either the state before or after any freeze, flush or
//! compaction. A separate mutex serializes flush and compaction, the only
//! two operations that change the table set.
//!
//! ## Guarantees
//!
//! - **Atomic flush:** the new table is published and the frozen memtable
//!   retired under one pair of write locks.
//! - **Publish before delete:** compaction inputs are unlinked only after
//!   the output replaced them in the table set. Readers holding an input
//!   keep their memory map alive.
//! - **No durability for unflushed writes:** there is no write-ahead log.
//!   [`Engine::close`] flushes everything, a crash loses the memtables.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::compaction::stcs::{MajorCompaction, MinorCompaction};
use crate::compaction::{self, CompactionError, CompactionStrategy};
use crate::encoding::{CodecRegistry, MarshalType};
use crate::key::{HexKey, Lexicographic};
use crate::memtable::{Memtable, MemtableError, MemtableGetResult, SkipListConfig};
use crate::sstable::{GetResult, SSTable, SSTableError, SstWriter};

pub mod utils;
pub use utils::PointEntry;

#[cfg(test)]
mod tests;

pub const SSTABLE_DIR: &str = "sstables";

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the memtable subsystem.
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Error originating from the SSTable subsystem.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Error originating from a compaction run.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configured marshal type has no codec in the registry.
    #[error("No codec registered for {0}")]
    UnsupportedMarshalType(MarshalType),

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration for an [`Engine`] instance.
///
/// Controls memtable sizing and all compaction thresholds. Passed to
/// [`Engine::open`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max memtable size (bytes) before freeze.
    pub write_buffer_size: usize,

    /// Max distinct keys in a memtable before freeze.
    pub max_memtable_entries: usize,

    /// Lower bound multiplier for window size range ([avg × bucket_low, avg × bucket_high]).
    pub bucket_low: f64,

    /// Upper bound multiplier for window size range.
    pub bucket_high: f64,

    /// SSTables smaller than this (bytes) always group with each other.
    pub min_sstable_size: usize,

    /// Min SSTables in a window to trigger minor compaction.
    pub min_threshold: usize,

    /// Max SSTables to compact at once in minor compaction.
    pub max_threshold: usize,

    /// Skip list shape for every memtable.
    pub skiplist: SkipListConfig,

    /// Codec used for values written by flush and compaction.
    pub marshal_type: MarshalType,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 64 * 1024,
            max_memtable_entries: 100_000,
            bucket_low: 0.5,
            bucket_high: 1.5,
            min_sstable_size: 4 * 1024,
            min_threshold: 4,
            max_threshold: 32,
            skiplist: SkipListConfig::default(),
            marshal_type: MarshalType::UNCOMPRESSED,
        }
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug)]
pub struct EngineStats {
    /// Number of frozen memtables pending flush.
    pub frozen_count: usize,
    /// Total number of SSTables in the table set.
    pub sstables_count: usize,
    /// Sum of all SSTable file sizes in bytes.
    pub total_sst_size_bytes: u64,
    /// Per-SSTable file sizes in bytes (newest-first order).
    pub sst_sizes: Vec<u64>,
    /// Tables left out of the table set because they failed validation.
    pub quarantined: Vec<PathBuf>,
}

// ------------------------------------------------------------------------------------------------
// Table identity
// ------------------------------------------------------------------------------------------------

/// Inclusive range of flush ids covered by one SSTable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId {
    pub lo: u64,
    pub hi: u64,
}

impl TableId {
    /// Id of a table produced by a single flush.
    pub fn single(id: u64) -> Self {
        Self { lo: id, hi: id }
    }

    /// File name of the table, e.g. `000003-000007.sst`.
    pub fn file_name(&self) -> String {
        format!("{:06}-{:06}.sst", self.lo, self.hi)
    }

    /// Parses a file name produced by [`TableId::file_name`].
    pub fn parse(file_name: &str) -> Option<Self> {
        let (lo, hi) = file_name.strip_suffix(".sst")?.split_once('-')?;
        let id = Self {
            lo: lo.parse().ok()?,
            hi: hi.parse().ok()?,
        };
        (id.lo <= id.hi).then_some(id)
    }

    /// `true` if `self` lies inside `other` and differs from it.
    pub fn strictly_within(&self, other: &TableId) -> bool {
        self != other && other.lo <= self.lo && self.hi <= other.hi
    }
}

/// One member of the table set.
#[derive(Clone)]
struct TableEntry {
    id: TableId,
    sst: Arc<SSTable>,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

struct EngineInner {
    /// Active memtable that accepts writes.
    active: RwLock<Arc<Memtable>>,

    /// Frozen memtables waiting to be flushed, newest first.
    frozen: RwLock<Vec<Arc<Memtable>>>,

    /// Loaded SSTables, oldest first.
    tables: RwLock<Vec<TableEntry>>,

    /// Next flush id. The mutex also serializes flush and compaction.
    next_table_id: Mutex<u64>,

    /// Tables rejected on open.
    quarantined: Vec<PathBuf>,

    /// Path where engine is mounted.
    data_dir: PathBuf,

    /// Codecs for writing and reading values.
    registry: Arc<CodecRegistry>,

    /// Thresholds, sizes, etc.
    config: EngineConfig,
}

/// Consistent view of every layer, taken for a single read.
struct ReadView {
    active: Arc<Memtable>,
    frozen: Vec<Arc<Memtable>>,
    tables: Vec<TableEntry>,
}

/// The main LSM storage engine handle.
///
/// Thread-safe: can be cloned and shared across threads.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Lock helpers
// ------------------------------------------------------------------------------------------------

fn read_lock<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, EngineError> {
    lock.read()
        .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
}

fn write_lock<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, EngineError> {
    lock.write()
        .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
}

fn mutex_lock<T>(lock: &Mutex<T>) -> Result<MutexGuard<'_, T>, EngineError> {
    lock.lock()
        .map_err(|_| EngineError::Internal("Mutex poisoned".into()))
}

fn sync_dir(path: &Path) -> Result<(), EngineError> {
    if let Ok(dir) = fs::File::open(path) {
        dir.sync_all()?;
    }
    Ok(())
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens (or creates) an engine rooted at the given directory.
    ///
    /// On an existing directory, leftover `*.tmp` files are deleted, every
    /// table is validated, and tables whose id range lies strictly within
    /// another table's range are deleted: they are inputs of a compaction
    /// that published its output but did not finish cleaning up. Tables
    /// that fail validation are kept on disk but left out of the table set.
    pub fn open(
        path: impl AsRef<Path>,
        config: EngineConfig,
        registry: Arc<CodecRegistry>,
    ) -> Result<Self, EngineError> {
        if !registry.contains(config.marshal_type) {
            return Err(EngineError::UnsupportedMarshalType(config.marshal_type));
        }

        // 0. Create necessary directories
        let base = path.as_ref();
        let sstable_dir = base.join(SSTABLE_DIR);
        fs::create_dir_all(&sstable_dir)?;

        // 1. Discover table files, dropping temp files of interrupted builds.
        let mut found: Vec<(TableId, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&sstable_dir)? {
            let file_path = entry?.path();
            if !file_path.is_file() {
                continue;
            }
            match file_path.extension().and_then(|s| s.to_str()) {
                Some("tmp") => {
                    debug!(path = %file_path.display(), "removing leftover temp file");
                    fs::remove_file(&file_path)?;
                }
                Some("sst") => {
                    match file_path
                        .file_name()
                        .and_then(|s| s.to_str())
                        .and_then(TableId::parse)
                    {
                        Some(id) => found.push((id, file_path)),
                        None => warn!(path = %file_path.display(), "ignoring unrecognised table name"),
                    }
                }
                _ => {}
            }
        }

        let next_table_id = found.iter().map(|(id, _)| id.hi).max().unwrap_or(0) + 1;

        // 2. Validate every table.
        let mut tables = Vec::with_capacity(found.len());
        let mut quarantined = Vec::new();
        for (id, file_path) in found {
            match SSTable::open(&file_path, Arc::clone(&registry)) {
                Ok(sst) => tables.push(TableEntry {
                    id,
                    sst: Arc::new(sst),
                }),
                Err(e) => {
                    error!(path = %file_path.display(), error = %e, "quarantining corrupt SSTable");
                    quarantined.push(file_path);
                }
            }
        }

        // 3. Remove inputs of a compaction that was published but not retired.
        let ids: Vec<TableId> = tables.iter().map(|t| t.id).collect();
        let mut live = Vec::with_capacity(tables.len());
        for table in tables {
            if ids.iter().any(|other| table.id.strictly_within(other)) {
                info!(path = %table.sst.path().display(), "removing superseded SSTable");
                fs::remove_file(table.sst.path())?;
            } else {
                live.push(table);
            }
        }
        live.sort_by_key(|t| t.id.hi);

        info!(
            path = %base.display(),
            sstables = live.len(),
            quarantined = quarantined.len(),
            next_table_id,
            "engine opened"
        );

        let inner = EngineInner {
            active: RwLock::new(Arc::new(Memtable::new(config.skiplist))),
            frozen: RwLock::new(Vec::new()),
            tables: RwLock::new(live),
            next_table_id: Mutex::new(next_table_id),
            quarantined,
            data_dir: base.to_path_buf(),
            registry,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Gracefully shuts down the engine.
    ///
    /// Freezes and flushes the active memtable and every frozen memtable,
    /// then fsyncs the table and root directories.
    pub fn close(&self) -> Result<(), EngineError> {
        self.force_freeze()?;
        let flushed = self.flush_all_frozen()?;

        sync_dir(&self.inner.data_dir.join(SSTABLE_DIR))?;
        sync_dir(&self.inner.data_dir)?;

        info!(path = %self.inner.data_dir.display(), flushed, "engine closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Insert or overwrite a key-value pair.
    ///
    /// Returns `Ok(true)` if the active memtable was frozen (caller should
    /// arrange a flush), `Ok(false)` otherwise.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<bool, EngineError> {
        trace!(key = %HexKey(&key), value_len = value.len(), "engine put");
        self.write_active(|active| active.put(key, value))
    }

    /// Delete a key (insert a tombstone).
    ///
    /// Returns `Ok(true)` if the active memtable was frozen, `Ok(false)` otherwise.
    pub fn delete(&self, key: Vec<u8>) -> Result<bool, EngineError> {
        trace!(key = %HexKey(&key), "engine delete");
        self.write_active(|active| active.delete(key))
    }

    /// Applies `op` to the active memtable, then freezes it if full.
    fn write_active(
        &self,
        op: impl FnOnce(&Memtable) -> Result<(), MemtableError>,
    ) -> Result<bool, EngineError> {
        let full = {
            let active = read_lock(&self.inner.active)?;
            op(&active)?;
            self.is_full(&active)?
        };
        if full { self.freeze(false) } else { Ok(false) }
    }

    fn is_full(&self, memtable: &Memtable) -> Result<bool, EngineError> {
        let config = &self.inner.config;
        Ok(memtable.approximate_size() >= config.write_buffer_size
            || memtable.len()? >= config.max_memtable_entries)
    }

    /// Freezes the active memtable regardless of its size.
    ///
    /// Returns `Ok(false)` if it was empty and nothing was frozen.
    pub fn force_freeze(&self) -> Result<bool, EngineError> {
        self.freeze(true)
    }

    /// Swaps in a fresh memtable and pushes the old one to the front of
    /// the frozen list.
    ///
    /// Without `force`, the swap only happens if the active memtable is
    /// still full; a concurrent writer may already have frozen it.
    fn freeze(&self, force: bool) -> Result<bool, EngineError> {
        let mut active = write_lock(&self.inner.active)?;

        let should_freeze = if force {
            !active.is_empty()?
        } else {
            self.is_full(&active)?
        };
        if !should_freeze {
            return Ok(false);
        }

        let fresh = Arc::new(Memtable::new(self.inner.config.skiplist));
        let old = std::mem::replace(&mut *active, fresh);

        let mut frozen = write_lock(&self.inner.frozen)?;
        info!(
            entries = old.len()?,
            size = old.approximate_size(),
            frozen = frozen.len() + 1,
            "memtable frozen"
        );
        frozen.insert(0, old);
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    fn read_view(&self) -> Result<ReadView, EngineError> {
        let active = read_lock(&self.inner.active)?;
        let frozen = read_lock(&self.inner.frozen)?;
        let tables = read_lock(&self.inner.tables)?;
        Ok(ReadView {
            active: Arc::clone(&active),
            frozen: frozen.clone(),
            tables: tables.clone(),
        })
    }

    /// Look up a single key.
    ///
    /// Returns `Ok(Some(value))` if the key exists, `Ok(None)` if it has
    /// been deleted or was never written, or `Err` on I/O or codec failure.
    ///
    /// The lookup order is: active memtable → frozen memtables → SSTables
    /// (all newest-first). The first definitive result wins.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        trace!(key = %HexKey(key), "engine get");
        let view = self.read_view()?;

        // --------------------------------------------------
        // 1. Memtables (active, then frozen newest → oldest)
        // --------------------------------------------------
        for memtable in std::iter::once(&view.active).chain(&view.frozen) {
            match memtable.get(key)? {
                MemtableGetResult::Put(value) => return Ok(Some(value)),
                MemtableGetResult::Delete => return Ok(None),
                MemtableGetResult::NotFound => {}
            }
        }

        // --------------------------------------------------
        // 2. SSTables (newest → oldest)
        // --------------------------------------------------
        for table in view.tables.iter().rev() {
            match table.sst.get(key) {
                Ok(GetResult::Put(value)) => return Ok(Some(value)),
                Ok(GetResult::Delete) => return Ok(None),
                Ok(GetResult::NotFound) => {}
                Err(SSTableError::Corrupt(reason)) => {
                    error!(
                        path = %table.sst.path().display(),
                        key = %HexKey(key),
                        reason = %reason,
                        "corrupt SSTable skipped during lookup"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    /// Returns a snapshot of engine statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let frozen_count = read_lock(&self.inner.frozen)?.len();
        let tables = read_lock(&self.inner.tables)?;

        let sst_sizes: Vec<u64> = tables.iter().rev().map(|t| t.sst.file_size()).collect();
        let total_sst_size_bytes: u64 = sst_sizes.iter().sum();

        Ok(EngineStats {
            frozen_count,
            sstables_count: tables.len(),
            total_sst_size_bytes,
            sst_sizes,
            quarantined: self.inner.quarantined.clone(),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    fn table_path(&self, id: TableId) -> PathBuf {
        self.inner.data_dir.join(SSTABLE_DIR).join(id.file_name())
    }

    /// Opens a freshly written flush or compaction output. An output that
    /// fails to open is removed so it is never picked up on reopen.
    fn open_output(&self, path: &Path) -> Result<Arc<SSTable>, EngineError> {
        match SSTable::open(path, Arc::clone(&self.inner.registry)) {
            Ok(sst) => Ok(Arc::new(sst)),
            Err(e) => {
                error!(path = %path.display(), error = %e, "new SSTable failed validation");
                if let Err(rm) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %rm, "failed to remove unreadable SSTable");
                }
                Err(e.into())
            }
        }
    }

    /// Flush the oldest frozen memtable to a new SSTable.
    ///
    /// Returns `Ok(true)` if a frozen memtable was flushed, `Ok(false)` if
    /// there were no frozen memtables to flush.
    pub fn flush_oldest_frozen(&self) -> Result<bool, EngineError> {
        let mut next_id = mutex_lock(&self.inner.next_table_id)?;
        self.flush_oldest_locked(&mut next_id)
    }

    /// Flush **all** frozen memtables to SSTables, oldest first.
    ///
    /// Returns the number of frozen memtables that were flushed.
    pub fn flush_all_frozen(&self) -> Result<usize, EngineError> {
        let mut next_id = mutex_lock(&self.inner.next_table_id)?;

        let mut count = 0usize;
        while self.flush_oldest_locked(&mut next_id)? {
            count += 1;
        }
        Ok(count)
    }

    fn flush_oldest_locked(&self, next_id: &mut u64) -> Result<bool, EngineError> {
        // Flushing oldest first keeps the table set in recency order.
        let Some(oldest) = read_lock(&self.inner.frozen)?.last().cloned() else {
            return Ok(false);
        };

        let entries = oldest.iter_for_flush()?;
        let record_count = entries.len();

        let published = if entries.is_empty() {
            None
        } else {
            let id = TableId::single(*next_id);
            *next_id += 1;
            let path = self.table_path(id);

            SstWriter::<Lexicographic>::new(&path, Arc::clone(&self.inner.registry))
                .with_marshal_type(self.inner.config.marshal_type)
                .build(entries)?;

            Some(TableEntry {
                id,
                sst: self.open_output(&path)?,
            })
        };

        // Publish the table and retire the memtable in one step.
        let mut frozen = write_lock(&self.inner.frozen)?;
        let mut tables = write_lock(&self.inner.tables)?;
        if let Some(entry) = &published {
            info!(
                path = %entry.sst.path().display(),
                records = record_count,
                file_size = entry.sst.file_size(),
                "memtable flushed"
            );
            tables.push(entry.clone());
        }
        frozen.retain(|m| !Arc::ptr_eq(m, &oldest));

        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction API
    // --------------------------------------------------------------------------------------------

    /// Runs one round of **minor compaction** (size-tiered).
    ///
    /// Selects the oldest window of adjacent, similarly-sized SSTables that
    /// reaches `min_threshold` and merges it into one SSTable.
    ///
    /// Returns `Ok(true)` if compaction was performed, `Ok(false)` if no
    /// window met the threshold.
    pub fn minor_compact(&self) -> Result<bool, EngineError> {
        self.run_compaction(&MinorCompaction)
    }

    /// Runs **major compaction**: merges all SSTables into one and drops
    /// every tombstone.
    ///
    /// Returns `Ok(true)` if compaction was performed, `Ok(false)` if there
    /// was nothing to merge.
    pub fn major_compact(&self) -> Result<bool, EngineError> {
        self.run_compaction(&MajorCompaction)
    }

    /// Execute a compaction strategy, applying the result to the engine.
    fn run_compaction(&self, strategy: &dyn CompactionStrategy) -> Result<bool, EngineError> {
        // Held to the end: the table set cannot change under us.
        let _structural = mutex_lock(&self.inner.next_table_id)?;

        let tables = read_lock(&self.inner.tables)?.clone();
        let ssts: Vec<Arc<SSTable>> = tables.iter().map(|t| Arc::clone(&t.sst)).collect();

        let Some(run) = strategy.select(&ssts, &self.inner.config) else {
            debug!(sst_count = tables.len(), "compaction strategy found nothing to do");
            return Ok(false);
        };
        let Some(inputs) = tables.get(run.clone()).filter(|inputs| !inputs.is_empty()) else {
            return Err(EngineError::Internal(format!(
                "strategy selected {run:?} out of {} tables",
                tables.len()
            )));
        };

        let id = TableId {
            lo: inputs.iter().map(|t| t.id.lo).min().unwrap_or(0),
            hi: inputs.iter().map(|t| t.id.hi).max().unwrap_or(0),
        };
        let output_path = self.table_path(id);

        let result = compaction::merge_run(
            &ssts,
            run.clone(),
            &output_path,
            Arc::clone(&self.inner.registry),
            self.inner.config.marshal_type,
        )?;

        let output = match &result.output {
            Some(path) => Some(TableEntry {
                id,
                sst: self.open_output(path)?,
            }),
            None => None,
        };

        // 1. Publish.
        {
            let mut set = write_lock(&self.inner.tables)?;
            set.splice(run.clone(), output.iter().cloned());
        }

        // 2. Retire inputs. A single-table run may share its name with the output.
        for input in inputs {
            let path = input.sst.path();
            if output.is_some() && path == output_path.as_path() {
                continue;
            }
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove compacted SSTable");
            }
        }

        info!(
            sst_count_before = tables.len(),
            removed = inputs.len(),
            output = ?result.output,
            records_in = result.records_in,
            records_out = result.records_out,
            tombstones_dropped = result.tombstones_dropped,
            "compaction applied"
        );
        Ok(true)
    }
}
