//! # Compaction Module
//!
//! Folds a contiguous run of SSTables into one, keeping only the newest
//! version of every key.
//!
//! ## Merge
//!
//! [`MergeIterator`] is a heap-based k-way merge over per-table cursors.
//! Sources are passed oldest first, so the source index doubles as the
//! table's recency. When several cursors sit on the same key, the value
//! from the highest source index wins and every tied cursor advances.
//! The output is strictly increasing by key.
//!
//! ## Tombstones
//!
//! A tombstone must survive compaction while an older table outside the
//! run might still hold a value for its key. A run that starts at the
//! oldest table of the set has nothing older beneath it, so its tombstones
//! are dropped together with the keys they delete.
//!
//! ## Strategies
//!
//! Which run to compact is decided by a [`CompactionStrategy`]. The
//! size-tiered family lives in [`stcs`]:
//!
//! - **Minor**: a contiguous window of similarly-sized tables.
//! - **Major**: the whole table set.
//!
//! Publishing the output and deleting the inputs belongs to the engine.

pub mod stcs;


use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::marker::PhantomData;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::encoding::{CodecRegistry, MarshalType};
use crate::engine::EngineConfig;
use crate::engine::utils::PointEntry;
use crate::key::{KeyOrder, Lexicographic};
use crate::sstable::{SSTable, SSTableError, SstWriter};

// ------------------------------------------------------------------------------------------------
// CompactionStrategy trait
// ------------------------------------------------------------------------------------------------

/// Chooses the run of tables to merge.
///
/// `sstables` is the table set ordered oldest first. Returning `None`
/// means there is nothing to do.
pub trait CompactionStrategy {
    /// Picks a contiguous, non-empty range of `sstables`.
    fn select(&self, sstables: &[Arc<SSTable>], config: &EngineConfig) -> Option<Range<usize>>;
}

// ------------------------------------------------------------------------------------------------
// Shared types
// ------------------------------------------------------------------------------------------------

/// Outcome of merging one run.
#[derive(Debug)]
pub struct CompactionResult {
    /// Positions of the merged tables in the input slice.
    pub run: Range<usize>,

    /// Path of the table built, or `None` when every record was dropped.
    pub output: Option<PathBuf>,

    /// Records read from the inputs.
    pub records_in: u64,

    /// Records written to the output.
    pub records_out: u64,

    /// Tombstones discarded because the run reached the oldest table.
    pub tombstones_dropped: u64,
}

/// Unified error type for compaction.
#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid run {start}..{end} over {len} tables")]
    InvalidRun {
        start: usize,
        end: usize,
        len: usize,
    },
}

// ------------------------------------------------------------------------------------------------
// MergeIterator: heap-based k-way merge with recency tie-break
// ------------------------------------------------------------------------------------------------

type Source<'a> = Box<dyn Iterator<Item = Result<PointEntry, SSTableError>> + 'a>;

/// Merges sorted sources into one sorted, de-duplicated stream.
///
/// `sources[i]` is older than `sources[i + 1]`.
pub struct MergeIterator<'a, O: KeyOrder = Lexicographic> {
    sources: Vec<Source<'a>>,
    heap: BinaryHeap<MergeHeapEntry<O>>,
    failed: bool,
    records_in: u64,
}

struct MergeHeapEntry<O> {
    entry: PointEntry,
    source_idx: usize,
    _order: PhantomData<O>,
}

impl<O: KeyOrder> Ord for MergeHeapEntry<O> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: smallest key first, then newest source first.
        O::compare(&other.entry.key, &self.entry.key)
            .then_with(|| self.source_idx.cmp(&other.source_idx))
    }
}

impl<O: KeyOrder> PartialOrd for MergeHeapEntry<O> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<O: KeyOrder> PartialEq for MergeHeapEntry<O> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<O: KeyOrder> Eq for MergeHeapEntry<O> {}

impl<'a, O: KeyOrder> MergeIterator<'a, O> {
    /// Primes every source. Fails on the first source error.
    pub fn new(mut sources: Vec<Source<'a>>) -> Result<Self, SSTableError> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        let mut records_in = 0;
        for (idx, source) in sources.iter_mut().enumerate() {
            if let Some(entry) = source.next().transpose()? {
                records_in += 1;
                heap.push(MergeHeapEntry {
                    entry,
                    source_idx: idx,
                    _order: PhantomData,
                });
            }
        }
        Ok(Self {
            sources,
            heap,
            failed: false,
            records_in,
        })
    }

    /// Number of records pulled from the sources so far.
    pub fn records_in(&self) -> u64 {
        self.records_in
    }

    fn refill(&mut self, idx: usize) -> Result<(), SSTableError> {
        if let Some(entry) = self.sources[idx].next().transpose()? {
            self.records_in += 1;
            self.heap.push(MergeHeapEntry {
                entry,
                source_idx: idx,
                _order: PhantomData,
            });
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<PointEntry>, SSTableError> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill(top.source_idx)?;

        // Older versions of the same key.
        while self
            .heap
            .peek()
            .is_some_and(|next| O::compare(&next.entry.key, &top.entry.key) == Ordering::Equal)
        {
            if let Some(shadowed) = self.heap.pop() {
                trace!(source = shadowed.source_idx, entry = %shadowed.entry, "shadowed");
                self.refill(shadowed.source_idx)?;
            }
        }

        Ok(Some(top.entry))
    }
}

impl<O: KeyOrder> Iterator for MergeIterator<'_, O> {
    type Item = Result<PointEntry, SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Execution: shared by every strategy
// ------------------------------------------------------------------------------------------------

/// Merges `sstables[run]` into a new table at `output`.
///
/// Tombstones are dropped when `run` starts at the oldest table. If nothing
/// survives, no file is created and [`CompactionResult::output`] is `None`.
/// On error no file is left at `output`.
pub fn merge_run(
    sstables: &[Arc<SSTable>],
    run: Range<usize>,
    output: &Path,
    registry: Arc<CodecRegistry>,
    marshal_type: MarshalType,
) -> Result<CompactionResult, CompactionError> {
    if run.is_empty() || run.end > sstables.len() {
        return Err(CompactionError::InvalidRun {
            start: run.start,
            end: run.end,
            len: sstables.len(),
        });
    }

    let drop_tombstones = run.start == 0;
    let sources: Vec<Source<'_>> = sstables[run.clone()]
        .iter()
        .map(|sst| Box::new(sst.iter()) as Source<'_>)
        .collect();
    let mut merge: MergeIterator<'_> = MergeIterator::new(sources)?;

    let mut records_out = 0u64;
    let mut tombstones_dropped = 0u64;
    let stream = std::iter::from_fn(|| {
        loop {
            match merge.next()? {
                Ok(entry) if drop_tombstones && entry.is_tombstone() => {
                    tombstones_dropped += 1;
                }
                item => {
                    records_out += u64::from(item.is_ok());
                    return Some(item);
                }
            }
        }
    });

    debug!(
        run_start = run.start,
        run_len = run.len(),
        drop_tombstones,
        path = %output.display(),
        "merging run"
    );

    let written = SstWriter::<Lexicographic>::new(output, registry)
        .with_marshal_type(marshal_type)
        .try_build(stream);

    let output = match written {
        Ok(_) => Some(output.to_path_buf()),
        Err(SSTableError::Empty) => None,
        Err(e) => return Err(e.into()),
    };

    Ok(CompactionResult {
        run,
        output,
        records_in: merge.records_in(),
        records_out,
        tombstones_dropped,
    })
}
