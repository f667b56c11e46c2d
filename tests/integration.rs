//! Integration tests for the public `Db` API.
//!
//! These tests exercise the full storage stack (memtable → SSTable →
//! compaction) through the public `lsmcore` surface only.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, idempotent close, Drop-based cleanup
//! - **CRUD**: put, get, delete, overwrite, nonexistent keys
//! - **Commands**: `execute` for every command shape and status code
//! - **Persistence**: data and deletes survive close → reopen
//! - **Compaction**: background and major compaction preserve data
//! - **Codecs**: custom value codec through `open_with_registry`
//! - **Config validation**: all `DbConfig` constraint violations rejected
//! - **Concurrency**: multi-thread writes, concurrent readers during writes

use std::sync::Arc;
use std::thread;

use lsmcore::{
    Codec, CodecRegistry, Command, Db, DbConfig, DbError, EncodingError, MarshalInput,
    MarshalType, Status,
};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Small write buffer to trigger frequent freezes and background flushes.
fn small_buffer_config() -> DbConfig {
    DbConfig {
        write_buffer_size: 1024,
        min_compaction_threshold: 4,
        max_compaction_threshold: 32,
        thread_pool_size: 2,
        ..DbConfig::default()
    }
}

fn reopen(path: &std::path::Path) -> Db {
    Db::open(path, DbConfig::default()).expect("reopen")
}

fn key(i: usize) -> Vec<u8> {
    format!("key_{i:05}").into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("value_{i:05}_with_some_padding").into_bytes()
}

fn table_files(path: &std::path::Path) -> usize {
    std::fs::read_dir(path.join("sstables"))
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .path()
                .extension()
                .is_some_and(|ext| ext == "sst")
        })
        .count()
}

// ================================================================================================
// Lifecycle
// ================================================================================================

#[test]
fn open_close_empty() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();
    db.close().unwrap();
}

#[test]
fn close_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();
    db.close().unwrap();
    db.close().unwrap();
}

/// # Scenario
/// The handle is dropped without an explicit `close()`.
///
/// # Expected behavior
/// `Drop` flushes the active memtable, so the data is visible after
/// reopening.
#[test]
fn drop_without_close() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path(), DbConfig::default()).unwrap();
        db.put(b"k", b"v").unwrap();
    }
    let db = reopen(dir.path());
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
}

// ================================================================================================
// CRUD
// ================================================================================================

#[test]
fn put_get_single() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();
    db.put(b"hello", b"world").unwrap();
    assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
}

#[test]
fn put_overwrite() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();
    db.put(b"k", b"v1").unwrap();
    db.put(b"k", b"v2").unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn delete_key() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();
    db.put(b"k", b"v").unwrap();
    db.delete(b"k").unwrap();
    assert_eq!(db.get(b"k").unwrap(), None);

    // Deleting a missing key is not an error.
    db.delete(b"never-written").unwrap();
}

#[test]
fn empty_value_is_distinct_from_delete() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();
    db.put(b"k", b"").unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(Vec::new()));

    db.flush().unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(Vec::new()));
}

#[test]
fn get_nonexistent_key() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();
    assert_eq!(db.get(b"missing").unwrap(), None);
}

/// # Scenario
/// A key lives in an SSTable and is deleted in the memtable.
///
/// # Expected behavior
/// The newer tombstone shadows the flushed value, both before and after
/// the tombstone itself is flushed.
#[test]
fn delete_shadows_flushed_value() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();
    db.put(b"k", b"old").unwrap();
    db.flush().unwrap();

    db.delete(b"k").unwrap();
    assert_eq!(db.get(b"k").unwrap(), None);
    db.flush().unwrap();
    assert_eq!(db.get(b"k").unwrap(), None);
    assert_eq!(db.stats().unwrap().sstables_count, 2);
}

// ================================================================================================
// Command interface
// ================================================================================================

/// # Scenario
/// Every command shape is executed against one key.
///
/// # Expected behavior
/// - `Add` then `Get` returns the value with `Status::Ok`.
/// - `Update` replaces it; `Update` of a missing key creates it.
/// - `Delete` then `Get` answers `Status::NotFound` with no data.
#[test]
fn execute_all_commands() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();

    let resp = db.execute(Command::Add {
        key: b"k".to_vec(),
        value: b"v1".to_vec(),
    });
    assert_eq!(resp.status, Status::Ok);
    assert!(resp.data.is_empty());

    let resp = db.execute(Command::Get { key: b"k".to_vec() });
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.data, vec![b"v1".to_vec()]);

    let resp = db.execute(Command::Update {
        key: b"k".to_vec(),
        new_value: b"v2".to_vec(),
    });
    assert!(resp.is_ok());
    assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));

    let resp = db.execute(Command::Update {
        key: b"fresh".to_vec(),
        new_value: b"x".to_vec(),
    });
    assert!(resp.is_ok());
    assert_eq!(db.get(b"fresh").unwrap(), Some(b"x".to_vec()));

    let resp = db.execute(Command::Delete { key: b"k".to_vec() });
    assert_eq!(resp.status.as_u8(), 0);

    let resp = db.execute(Command::Get { key: b"k".to_vec() });
    assert_eq!(resp.status, Status::NotFound);
    assert_eq!(resp.status.as_u8(), 1);
    assert!(resp.data.is_empty());
}

#[test]
fn execute_rejects_empty_key() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();

    for cmd in [
        Command::Add {
            key: vec![],
            value: b"v".to_vec(),
        },
        Command::Delete { key: vec![] },
        Command::Update {
            key: vec![],
            new_value: b"v".to_vec(),
        },
        Command::Get { key: vec![] },
    ] {
        let resp = db.execute(cmd);
        assert_eq!(resp.status, Status::InvalidArgument);
        assert_eq!(resp.status.as_u8(), 2);
        assert!(resp.message.contains("empty"));
    }
}

#[test]
fn execute_after_close_reports_error() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();
    db.close().unwrap();

    let resp = db.execute(Command::Get { key: b"k".to_vec() });
    assert_eq!(resp.status, Status::Error);
    assert_eq!(resp.status.as_u8(), 3);
    assert_eq!(resp.message, "database is closed");
}

// ================================================================================================
// Persistence
// ================================================================================================

#[test]
fn persistence_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path(), DbConfig::default()).unwrap();
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();
        db.close().unwrap();
    }
    let db = reopen(dir.path());
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
}

/// # Scenario
/// Enough writes through a 1 KiB buffer to produce many background
/// flushes and compactions, with a third of the keys deleted.
///
/// # Expected behavior
/// After close and reopen every live key has its value and every deleted
/// key stays deleted.
#[test]
fn persistence_many_writes_and_deletes() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path(), small_buffer_config()).unwrap();
        for i in 0..2000 {
            db.put(&key(i), &value(i)).unwrap();
        }
        for i in (0..2000).step_by(3) {
            db.delete(&key(i)).unwrap();
        }
        db.close().unwrap();
    }

    let db = reopen(dir.path());
    for i in 0..2000 {
        let expected = (i % 3 != 0).then(|| value(i));
        assert_eq!(db.get(&key(i)).unwrap(), expected, "key {i}");
    }
    assert_eq!(db.stats().unwrap().frozen_count, 0);
}

// ================================================================================================
// Compaction
// ================================================================================================

#[test]
fn major_compaction() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();
    for round in 0..5 {
        for i in 0..50 {
            db.put(&key(i), format!("r{round}").as_bytes()).unwrap();
        }
        db.flush().unwrap();
    }
    assert_eq!(db.stats().unwrap().sstables_count, 5);

    assert!(db.major_compact().unwrap());
    let stats = db.stats().unwrap();
    assert_eq!(stats.sstables_count, 1);
    assert_eq!(table_files(dir.path()), 1);
    for i in 0..50 {
        assert_eq!(db.get(&key(i)).unwrap(), Some(b"r4".to_vec()));
    }
}

#[test]
fn major_compaction_removes_deleted_keys() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();
    for i in 0..100 {
        db.put(&key(i), &value(i)).unwrap();
    }
    db.flush().unwrap();
    for i in 0..100 {
        db.delete(&key(i)).unwrap();
    }
    db.flush().unwrap();

    assert!(db.major_compact().unwrap());
    assert_eq!(db.stats().unwrap().sstables_count, 0);
    assert_eq!(table_files(dir.path()), 0);
    for i in 0..100 {
        assert_eq!(db.get(&key(i)).unwrap(), None);
    }
}

/// # Scenario
/// Sustained writes through a small buffer with `min_compaction_threshold = 2`.
///
/// # Expected behavior
/// Background minor compaction keeps the table count well below the
/// number of flushes, and all data stays readable.
#[test]
fn background_compaction_bounds_table_count() {
    let dir = TempDir::new().unwrap();
    let config = DbConfig {
        min_compaction_threshold: 2,
        ..small_buffer_config()
    };
    let db = Db::open(dir.path(), config).unwrap();
    for i in 0..3000 {
        db.put(&key(i), &value(i)).unwrap();
    }
    db.close().unwrap();

    let db = reopen(dir.path());
    let stats = db.stats().unwrap();
    assert!(stats.sstables_count < 40, "{} tables", stats.sstables_count);
    assert_eq!(stats.sst_sizes.len(), stats.sstables_count);
    for i in (0..3000).step_by(37) {
        assert_eq!(db.get(&key(i)).unwrap(), Some(value(i)));
    }
}

// ================================================================================================
// Codecs
// ================================================================================================

/// Reverses value bytes.
struct Reverse;

impl Codec for Reverse {
    fn marshal(&self, dst: &mut Vec<u8>, input: MarshalInput<'_>) -> Result<(), EncodingError> {
        match input {
            MarshalInput::Bytes(b) => {
                dst.extend(b.iter().rev());
                Ok(())
            }
            other => Err(EncodingError::UnsupportedType(other.kind().into())),
        }
    }

    fn unmarshal_bytes(&self, src: &[u8]) -> Result<Vec<u8>, EncodingError> {
        Ok(src.iter().rev().copied().collect())
    }
}

#[test]
fn custom_codec_via_registry() {
    let dir = TempDir::new().unwrap();
    let mut registry = CodecRegistry::new();
    registry.register(MarshalType(9), Arc::new(Reverse));
    let registry = Arc::new(registry);
    let config = || DbConfig {
        marshal_type: MarshalType(9),
        ..DbConfig::default()
    };

    {
        let db = Db::open_with_registry(dir.path(), config(), Arc::clone(&registry)).unwrap();
        db.put(b"k", b"abc").unwrap();
        db.close().unwrap();
    }
    let db = Db::open_with_registry(dir.path(), config(), registry).unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"abc".to_vec()));
}

#[test]
fn unregistered_marshal_type_rejected() {
    let dir = TempDir::new().unwrap();
    let config = DbConfig {
        marshal_type: MarshalType(200),
        ..DbConfig::default()
    };
    assert!(matches!(
        Db::open(dir.path(), config),
        Err(DbError::Engine(_))
    ));
}

// ================================================================================================
// Config validation
// ================================================================================================

fn assert_invalid_config(config: DbConfig) {
    let dir = TempDir::new().unwrap();
    let result = Db::open(dir.path(), config);
    assert!(
        matches!(result, Err(DbError::InvalidConfig(_))),
        "expected InvalidConfig, got {result:?}"
    );
}

#[test]
fn config_write_buffer_too_small() {
    assert_invalid_config(DbConfig {
        write_buffer_size: 512,
        ..DbConfig::default()
    });
}

#[test]
fn config_zero_memtable_entries() {
    assert_invalid_config(DbConfig {
        max_memtable_entries: 0,
        ..DbConfig::default()
    });
}

#[test]
fn config_min_threshold_too_small() {
    assert_invalid_config(DbConfig {
        min_compaction_threshold: 1,
        ..DbConfig::default()
    });
}

#[test]
fn config_max_below_min() {
    assert_invalid_config(DbConfig {
        min_compaction_threshold: 8,
        max_compaction_threshold: 4,
        ..DbConfig::default()
    });
}

#[test]
fn config_zero_threads() {
    assert_invalid_config(DbConfig {
        thread_pool_size: 0,
        ..DbConfig::default()
    });
}

// ================================================================================================
// Error handling
// ================================================================================================

#[test]
fn operations_after_close() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();
    db.close().unwrap();

    assert!(matches!(db.put(b"k", b"v"), Err(DbError::Closed)));
    assert!(matches!(db.get(b"k"), Err(DbError::Closed)));
    assert!(matches!(db.delete(b"k"), Err(DbError::Closed)));
    assert!(matches!(db.flush(), Err(DbError::Closed)));
    assert!(matches!(db.major_compact(), Err(DbError::Closed)));
    assert!(matches!(db.stats(), Err(DbError::Closed)));
}

#[test]
fn empty_key_rejected() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();

    assert!(matches!(db.put(b"", b"v"), Err(DbError::InvalidArgument(_))));
    assert!(matches!(db.get(b""), Err(DbError::InvalidArgument(_))));
    assert!(matches!(db.delete(b""), Err(DbError::InvalidArgument(_))));
}

// ================================================================================================
// Concurrency
// ================================================================================================

#[test]
fn concurrent_writes_and_reads() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Db::open(dir.path(), small_buffer_config()).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..300 {
                    let k = format!("t{t}_{i:04}");
                    db.put(k.as_bytes(), &value(i)).unwrap();
                    assert_eq!(db.get(k.as_bytes()).unwrap(), Some(value(i)));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..4 {
        for i in 0..300 {
            let k = format!("t{t}_{i:04}");
            assert_eq!(db.get(k.as_bytes()).unwrap(), Some(value(i)));
        }
    }
    db.close().unwrap();
}

/// # Scenario
/// Readers poll a pre-populated key range while a writer keeps adding
/// new keys, driving background flushes and compactions.
///
/// # Expected behavior
/// Pre-populated keys are never observed missing.
#[test]
fn concurrent_reads_during_writes() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Db::open(dir.path(), small_buffer_config()).unwrap());
    for i in 0..200 {
        db.put(&key(i), &value(i)).unwrap();
    }

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 200..2000 {
                db.put(&key(i), &value(i)).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for _ in 0..20 {
                    for i in (0..200).step_by(11) {
                        assert_eq!(db.get(&key(i)).unwrap(), Some(value(i)));
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    db.close().unwrap();
}
