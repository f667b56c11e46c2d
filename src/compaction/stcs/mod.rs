//! # Size-Tiered Compaction Strategy (STCS)
//!
//! Groups SSTables into **size windows** and provides two selections:
//!
//! - **Minor**: merges a window of similarly-sized, adjacent SSTables.
//!   Tombstones are kept unless the window starts at the oldest table.
//! - **Major**: merges *all* SSTables into one and drops every tombstone.
//!
//! Unlike classic STCS, a window only ever holds tables that are adjacent
//! in recency order. Merging non-adjacent tables would let the output jump
//! over a newer table that sits between them and break newest-wins reads.

#[cfg(test)]
mod tests;

use std::ops::Range;
use std::sync::Arc;

use tracing::debug;

use crate::compaction::CompactionStrategy;
use crate::engine::EngineConfig;
use crate::sstable::SSTable;

// ------------------------------------------------------------------------------------------------
// Windowing
// ------------------------------------------------------------------------------------------------

/// Splits the table set (oldest first) into contiguous size windows.
///
/// A table joins the current window when its file size lies within
/// `[window_avg × bucket_low, window_avg × bucket_high]`. Tables below
/// `config.min_sstable_size` always join a window whose average is also
/// below it. Every index appears in exactly one window.
pub fn size_windows(sstables: &[Arc<SSTable>], config: &EngineConfig) -> Vec<Range<usize>> {
    let mut windows = Vec::new();
    if sstables.is_empty() {
        return windows;
    }

    let small = config.min_sstable_size as f64;
    let mut start = 0usize;
    let mut total = sstables[0].file_size() as f64;

    for (idx, sst) in sstables.iter().enumerate().skip(1) {
        let size = sst.file_size() as f64;
        let avg = total / (idx - start) as f64;

        let both_small = size < small && avg < small;
        let similar = size >= avg * config.bucket_low && size <= avg * config.bucket_high;

        if both_small || similar {
            total += size;
        } else {
            windows.push(start..idx);
            start = idx;
            total = size;
        }
    }
    windows.push(start..sstables.len());

    windows
}

/// Picks the oldest window holding at least `min_threshold` tables,
/// trimmed to its oldest `max_threshold` tables.
pub fn select_compaction_window(
    windows: &[Range<usize>],
    config: &EngineConfig,
) -> Option<Range<usize>> {
    let min = config.min_threshold.max(2);
    windows
        .iter()
        .find(|w| w.len() >= min)
        .map(|w| w.start..w.start + w.len().min(config.max_threshold.max(min)))
}

// ------------------------------------------------------------------------------------------------
// CompactionStrategy implementations
// ------------------------------------------------------------------------------------------------

/// STCS minor compaction: one window of similarly-sized tables.
pub struct MinorCompaction;

impl CompactionStrategy for MinorCompaction {
    fn select(&self, sstables: &[Arc<SSTable>], config: &EngineConfig) -> Option<Range<usize>> {
        let windows = size_windows(sstables, config);
        let selected = select_compaction_window(&windows, config);
        debug!(
            sstables = sstables.len(),
            windows = windows.len(),
            selected = ?selected,
            "minor compaction selection"
        );
        selected
    }
}

/// STCS major compaction: the whole table set.
///
/// A lone table is rewritten only if it still carries tombstones.
pub struct MajorCompaction;

impl CompactionStrategy for MajorCompaction {
    fn select(&self, sstables: &[Arc<SSTable>], _config: &EngineConfig) -> Option<Range<usize>> {
        match sstables {
            [] => None,
            [only] if only.properties().tombstone_count == 0 => None,
            _ => Some(0..sstables.len()),
        }
    }
}
