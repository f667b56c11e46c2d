//! # lsmcore
//!
//! Storage core of an embeddable key-value store built on a
//! **Log-Structured Merge Tree (LSM-tree)**. Writes land in an in-memory
//! skip list; full memtables are frozen and flushed to immutable, sorted
//! SSTable files; background workers merge similarly-sized tables.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lsmcore::{Command, Db, DbConfig, Status};
//!
//! let db = Db::open("/tmp/my_db", DbConfig::default()).unwrap();
//!
//! // Write
//! db.put(b"hello", b"world").unwrap();
//!
//! // Read
//! assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! // Delete
//! db.delete(b"hello").unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), None);
//!
//! // Command interface
//! let resp = db.execute(Command::Get { key: b"hello".to_vec() });
//! assert_eq!(resp.status, Status::NotFound);
//!
//! // Graceful shutdown
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Skip-list memtable** with tombstones, frozen and flushed in the background.
//! - **Self-describing SSTables** with per-record CRC32 and pluggable value codecs.
//! - **Size-tiered compaction** over contiguous runs of tables.
//! - **Bloom filters** for fast negative lookups on SSTables.
//!
//! There is no write-ahead log: data survives a crash only once it has
//! been flushed. [`Db::close`] flushes everything still in memory.

pub mod command;
pub(crate) mod compaction;
pub mod encoding;
pub(crate) mod engine;
pub mod key;
pub(crate) mod memtable;
pub(crate) mod sstable;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use engine::{Engine, EngineConfig};
use thiserror::Error;
use tracing::{debug, error, info, trace};

pub use command::{Command, Response, Status};
pub use encoding::{Codec, CodecRegistry, EncodingError, MarshalInput, MarshalType};
pub use engine::{EngineError, EngineStats};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// All fields have defaults via [`DbConfig::default()`]. The configuration
/// is validated when passed to [`Db::open`].
///
/// # Example
///
/// ```rust
/// use lsmcore::DbConfig;
///
/// let config = DbConfig {
///     write_buffer_size: 128 * 1024,
///     thread_pool_size: 4,
///     ..DbConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Approximate memtable size in bytes at which it is frozen and
    /// flushed in the background.
    ///
    /// Default: 64 KiB. Must be ≥ 1024.
    pub write_buffer_size: usize,

    /// Number of distinct keys at which the memtable is frozen,
    /// whichever of the two limits is reached first.
    ///
    /// Default: 100 000. Must be ≥ 1.
    pub max_memtable_entries: usize,

    /// Minimum number of similarly-sized adjacent SSTables required to
    /// trigger background minor compaction.
    ///
    /// Default: 4. Must be ≥ 2.
    pub min_compaction_threshold: usize,

    /// Maximum number of SSTables merged in a single minor compaction.
    ///
    /// Default: 32. Must be ≥ `min_compaction_threshold`.
    pub max_compaction_threshold: usize,

    /// Number of background worker threads for flushing and compaction.
    ///
    /// Default: 2. Must be ≥ 1.
    pub thread_pool_size: usize,

    /// Codec applied to values written to SSTables. Must be registered
    /// in the [`CodecRegistry`] the database is opened with.
    ///
    /// Default: [`MarshalType::UNCOMPRESSED`].
    pub marshal_type: MarshalType,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 64 * 1024,
            max_memtable_entries: 100_000,
            min_compaction_threshold: 4,
            max_compaction_threshold: 32,
            thread_pool_size: 2,
            marshal_type: MarshalType::UNCOMPRESSED,
        }
    }
}

impl DbConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), DbError> {
        if self.write_buffer_size < 1024 {
            return Err(DbError::InvalidConfig(
                "write_buffer_size must be >= 1024".into(),
            ));
        }
        if self.max_memtable_entries < 1 {
            return Err(DbError::InvalidConfig(
                "max_memtable_entries must be >= 1".into(),
            ));
        }
        if self.min_compaction_threshold < 2 {
            return Err(DbError::InvalidConfig(
                "min_compaction_threshold must be >= 2".into(),
            ));
        }
        if self.max_compaction_threshold < self.min_compaction_threshold {
            return Err(DbError::InvalidConfig(
                "max_compaction_threshold must be >= min_compaction_threshold".into(),
            ));
        }
        if self.thread_pool_size < 1 {
            return Err(DbError::InvalidConfig(
                "thread_pool_size must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            write_buffer_size: self.write_buffer_size,
            max_memtable_entries: self.max_memtable_entries,
            min_threshold: self.min_compaction_threshold,
            max_threshold: self.max_compaction_threshold,
            marshal_type: self.marshal_type,
            ..EngineConfig::default()
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Key constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

impl DbError {
    fn into_response(self) -> Response {
        match self {
            DbError::InvalidArgument(msg) => Response::invalid_argument(msg),
            other => Response::error(other.to_string()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Background worker state
// ------------------------------------------------------------------------------------------------

type Task = Box<dyn FnOnce() + Send>;

/// Holds the thread pool sender and worker handles.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
struct BackgroundPool {
    sender: crossbeam::channel::Sender<Task>,
    workers: Vec<thread::JoinHandle<()>>,
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// Thread-safe: share it across threads through `Arc<Db>`.
///
/// # Background work
///
/// When a write fills the active memtable, the memtable is frozen and a
/// task is queued on the worker pool that:
///
/// 1. Flushes the oldest frozen memtable to a new SSTable.
/// 2. Runs minor compaction rounds until no run of tables qualifies.
///
/// Failures are logged and left for the next task; nothing is retried.
/// Major compaction is only run on request via [`Db::major_compact`].
///
/// # Shutdown
///
/// Call [`Db::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor attempts the same cleanup and
/// ignores errors.
pub struct Db {
    engine: Engine,
    bg: Mutex<Option<BackgroundPool>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) a database at the given directory with the
    /// default codec registry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidConfig`] if any configuration parameter
    /// is out of range.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        Self::open_with_registry(path, config, Arc::new(CodecRegistry::new()))
    }

    /// Opens (or creates) a database whose values are encoded through
    /// codecs from `registry`.
    ///
    /// Existing tables are loaded; tables that fail validation are left
    /// on disk and reported in [`EngineStats::quarantined`].
    pub fn open_with_registry(
        path: impl AsRef<Path>,
        config: DbConfig,
        registry: Arc<CodecRegistry>,
    ) -> Result<Self, DbError> {
        config.validate()?;

        let pool_size = config.thread_pool_size;
        let engine = Engine::open(&path, config.to_engine_config(), registry)?;

        let (sender, receiver) = crossbeam::channel::unbounded::<Task>();

        let mut workers = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("lsmcore-bg-{id}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .map_err(EngineError::Io)?;
            workers.push(handle);
        }
        // Workers hold their own receiver clones.
        drop(receiver);

        info!(path = %path.as_ref().display(), pool_size, "database opened");

        Ok(Self {
            engine,
            bg: Mutex::new(Some(BackgroundPool { sender, workers })),
            closed: AtomicBool::new(false),
        })
    }

    /// Gracefully shuts down the database.
    ///
    /// Waits for queued background tasks, then flushes every memtable
    /// (including the active one) and fsyncs the table directory.
    ///
    /// Subsequent operations on this handle return [`DbError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown_pool();
        self.engine.close()?;

        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Inserts or replaces the value under `key`.
    ///
    /// If the write fills the memtable, it is frozen and a background
    /// flush is scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` is empty.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.check_open()?;
        check_key(key)?;

        let frozen = self.engine.put(key.to_vec(), value.to_vec())?;
        if frozen {
            self.schedule_flush();
        }
        Ok(())
    }

    /// Deletes a key by writing a tombstone.
    ///
    /// Subsequent reads return `None` until a new value is written.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` is empty.
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.check_open()?;
        check_key(key)?;

        let frozen = self.engine.delete(key.to_vec())?;
        if frozen {
            self.schedule_flush();
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Retrieves the most recent value of a key.
    ///
    /// Returns `Ok(None)` if the key does not exist or has been deleted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` is empty.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.check_open()?;
        check_key(key)?;

        Ok(self.engine.get(key)?)
    }

    /// Executes a [`Command`] and reports the outcome as a [`Response`].
    ///
    /// `Add` and `Update` both store the value whether or not the key
    /// exists. `Get` returns the value as the single element of `data`,
    /// or [`Status::NotFound`].
    pub fn execute(&self, command: Command) -> Response {
        trace!(%command, "execute");
        let result = match command {
            Command::Add { key, value } => self.put(&key, &value).map(|()| Response::ok()),
            Command::Update { key, new_value } => {
                self.put(&key, &new_value).map(|()| Response::ok())
            }
            Command::Delete { key } => self.delete(&key).map(|()| Response::ok()),
            Command::Get { key } => self.get(&key).map(|found| match found {
                Some(value) => Response::found(value),
                None => Response::not_found(),
            }),
        };
        result.unwrap_or_else(DbError::into_response)
    }

    /// Returns a snapshot of memtable and table-set statistics.
    pub fn stats(&self) -> Result<EngineStats, DbError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    // --------------------------------------------------------------------------------------------
    // Flush and compaction
    // --------------------------------------------------------------------------------------------

    /// Freezes the active memtable and flushes every frozen memtable to
    /// SSTables. Blocks until done.
    pub fn flush(&self) -> Result<(), DbError> {
        self.check_open()?;
        self.engine.force_freeze()?;
        let flushed = self.engine.flush_all_frozen()?;
        debug!(flushed, "explicit flush");
        Ok(())
    }

    /// Runs a **major compaction**, merging every SSTable into one and
    /// dropping all tombstones. Blocks until done.
    ///
    /// Returns `true` if a compaction was performed.
    pub fn major_compact(&self) -> Result<bool, DbError> {
        self.check_open()?;
        Ok(self.engine.major_compact()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    /// Queues a background task that flushes the oldest frozen memtable
    /// and then runs minor compaction until nothing qualifies.
    fn schedule_flush(&self) {
        let Ok(guard) = self.bg.lock() else {
            error!("background pool lock poisoned, flush not scheduled");
            return;
        };
        if let Some(bg) = guard.as_ref() {
            let engine = self.engine.clone();
            let _ = bg.sender.send(Box::new(move || {
                match engine.flush_oldest_frozen() {
                    Ok(true) => debug!("background: flushed frozen memtable"),
                    Ok(false) => return,
                    Err(e) => {
                        error!("background flush failed: {e}");
                        return;
                    }
                }

                loop {
                    match engine.minor_compact() {
                        Ok(true) => debug!("background: minor compaction round"),
                        Ok(false) => break,
                        Err(e) => {
                            error!("background minor compaction failed: {e}");
                            break;
                        }
                    }
                }
            }));
        }
    }

    /// Drains the background task queue and joins all worker threads.
    fn shutdown_pool(&self) {
        let pool = match self.bg.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(bg) = pool {
            // Dropping the sender lets workers drain the queue and exit.
            drop(bg.sender);
            for worker in bg.workers {
                let _ = worker.join();
            }
        }
    }
}

fn check_key(key: &[u8]) -> Result<(), DbError> {
    if key.is_empty() {
        return Err(DbError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown_pool();
            let _ = self.engine.close();
        }
    }
}
