use crate::encoding::{Codec, CodecRegistry, EncodingError, MarshalInput, MarshalType};
use crate::engine::{Engine, EngineConfig};
use crate::memtable::SkipListConfig;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config_with_buffer(write_buffer_size: usize) -> EngineConfig {
    init_tracing();
    EngineConfig {
        write_buffer_size,
        min_sstable_size: 1024,
        skiplist: SkipListConfig {
            seed: Some(0x5eed),
            ..SkipListConfig::default()
        },
        ..EngineConfig::default()
    }
}

/// Standard config for tests that should NOT trigger SSTable flushes.
pub fn memtable_only_config() -> EngineConfig {
    config_with_buffer(64 * 1024)
}

/// Small write buffer that freezes the memtable after a couple of entries.
pub fn small_buffer_config() -> EngineConfig {
    config_with_buffer(128)
}

/// Standard 4KB config.
pub fn default_config() -> EngineConfig {
    config_with_buffer(4096)
}

/// 1KB write buffer: roughly 15 entries of [`key`] / [`value`] per table.
pub fn multi_sstable_config() -> EngineConfig {
    config_with_buffer(1024)
}

/// Opens an engine with the default codec registry.
pub fn open(path: &Path, config: EngineConfig) -> Engine {
    Engine::open(path, config, Arc::new(CodecRegistry::new())).expect("open")
}

pub fn key(prefix: &str, i: usize) -> Vec<u8> {
    format!("{}_{:04}", prefix, i).into_bytes()
}

pub fn value(i: usize) -> Vec<u8> {
    format!("value_with_some_padding_{:04}", i).into_bytes()
}

/// Helper: open engine, put enough data to force at least one SSTable flush.
/// Returns the engine with data already flushed to SSTables.
pub fn engine_with_sstables(path: &Path, num_keys: usize, prefix: &str) -> Engine {
    let engine = open(path, default_config());
    for i in 0..num_keys {
        engine.put(key(prefix, i), value(i)).expect("put");
    }
    engine.flush_all_frozen().expect("flush");
    let stats = engine.stats().expect("stats");
    assert!(stats.sstables_count > 0, "Expected SSTables to be created");
    engine
}

/// Helper: open engine with 1KB buffer, put enough data to force at least 2 SSTables.
/// Returns the engine with data spread across multiple SSTables.
pub fn engine_with_multi_sstables(
    path: &Path,
    config: EngineConfig,
    num_keys: usize,
    prefix: &str,
) -> Engine {
    let engine = open(path, config);
    for i in 0..num_keys {
        engine.put(key(prefix, i), value(i)).expect("put");
    }
    engine.flush_all_frozen().expect("flush");
    let stats = engine.stats().expect("stats");
    assert!(
        stats.sstables_count >= 2,
        "Expected at least 2 SSTables, got {}",
        stats.sstables_count
    );
    engine
}

/// Helper: reopen an engine directory with the default config.
pub fn reopen(path: &Path) -> Engine {
    open(path, default_config())
}

/// Names of the `.sst` files currently on disk, sorted.
pub fn sst_files(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(path.join(crate::engine::SSTABLE_DIR))
        .expect("read_dir")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".sst"))
        .collect();
    names.sort();
    names
}

/// Names of leftover `.tmp` files in the SSTable directory.
pub fn tmp_files(path: &Path) -> Vec<String> {
    std::fs::read_dir(path.join(crate::engine::SSTABLE_DIR))
        .expect("read_dir")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect()
}

/// Marshal type the [`RejectingCodec`] is registered under.
pub const REJECTING: MarshalType = MarshalType(9);

/// Passthrough codec whose `marshal` fails on the payload `reject` while
/// armed. Decoding always succeeds, so stored values stay readable.
#[derive(Default)]
pub struct RejectingCodec {
    armed: AtomicBool,
}

impl RejectingCodec {
    pub fn armed() -> Self {
        Self {
            armed: AtomicBool::new(true),
        }
    }

    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }
}

impl Codec for RejectingCodec {
    fn marshal(&self, dst: &mut Vec<u8>, input: MarshalInput<'_>) -> Result<(), EncodingError> {
        match input {
            MarshalInput::Bytes(b) if b == b"reject" && self.armed.load(Ordering::SeqCst) => {
                Err(EncodingError::UnsupportedType("rejected payload".into()))
            }
            MarshalInput::Bytes(b) => {
                dst.extend_from_slice(b);
                Ok(())
            }
            other => Err(EncodingError::UnsupportedType(other.kind().into())),
        }
    }

    fn unmarshal_bytes(&self, src: &[u8]) -> Result<Vec<u8>, EncodingError> {
        Ok(src.to_vec())
    }
}

/// Opens an engine that writes every table through `codec`.
pub fn open_with_codec(path: &Path, config: EngineConfig, codec: Arc<RejectingCodec>) -> Engine {
    let mut registry = CodecRegistry::new();
    registry.register(REJECTING, codec);
    let config = EngineConfig {
        marshal_type: REJECTING,
        ..config
    };
    Engine::open(path, config, Arc::new(registry)).expect("open")
}
