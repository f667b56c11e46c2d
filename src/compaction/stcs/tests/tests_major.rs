//! Major compaction selection tests.

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::compaction::CompactionStrategy;
    use crate::compaction::stcs::MajorCompaction;
    use crate::encoding::CodecRegistry;
    use crate::engine::EngineConfig;
    use crate::engine::utils::PointEntry;
    use crate::sstable::{SSTable, SstWriter};

    fn table(dir: &Path, name: &str, entries: Vec<PointEntry>) -> Arc<SSTable> {
        let path = dir.join(name);
        let registry = Arc::new(CodecRegistry::new());
        SstWriter::<crate::key::Lexicographic>::new(&path, Arc::clone(&registry))
            .build(entries)
            .unwrap();
        Arc::new(SSTable::open(&path, registry).unwrap())
    }

    #[test]
    fn nothing_to_do_on_empty_set() {
        assert_eq!(MajorCompaction.select(&[], &EngineConfig::default()), None);
    }

    #[test]
    fn lone_table_without_tombstones_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let set = vec![table(
            tmp.path(),
            "a.sst",
            vec![PointEntry::new(b"a".to_vec(), b"1".to_vec())],
        )];
        assert_eq!(MajorCompaction.select(&set, &EngineConfig::default()), None);
    }

    #[test]
    fn lone_table_with_tombstones_is_rewritten() {
        let tmp = TempDir::new().unwrap();
        let set = vec![table(
            tmp.path(),
            "a.sst",
            vec![
                PointEntry::new(b"a".to_vec(), b"1".to_vec()),
                PointEntry::new_delete(b"b".to_vec()),
            ],
        )];
        assert_eq!(MajorCompaction.select(&set, &EngineConfig::default()), Some(0..1));
    }

    /// # Scenario
    /// Tables of very different sizes that minor compaction would never
    /// group.
    ///
    /// # Expected behavior
    /// Major compaction ignores size and takes the whole set.
    #[test]
    fn whole_set_regardless_of_size() {
        let tmp = TempDir::new().unwrap();
        let big: Vec<PointEntry> = (0..500u32)
            .map(|i| PointEntry::new(format!("k{i:05}").into_bytes(), vec![1u8; 64]))
            .collect();
        let set = vec![
            table(tmp.path(), "big.sst", big),
            table(tmp.path(), "tiny.sst", vec![PointEntry::new(b"z".to_vec(), b"1".to_vec())]),
            table(tmp.path(), "tiny2.sst", vec![PointEntry::new_delete(b"q".to_vec())]),
        ];
        assert_eq!(MajorCompaction.select(&set, &EngineConfig::default()), Some(0..3));
    }
}
