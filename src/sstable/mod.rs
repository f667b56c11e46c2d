//! Sorted String Table (SSTable) Module
//!
//! This module implements the **immutable**, **disk-backed** sorted table a
//! frozen memtable is flushed into, and that compaction reads from and
//! writes to.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER (32 B)]  DataOffset u64 | DataSize u64 | IndexOffset u64 | IndexSize u64
//! [DATA]           record 0 | record 1 | ... | record n-1
//! [INDEX]          (ElemOffset u64, ElemSize u64) x n
//! ```
//!
//! All integers are big-endian. `DataOffset` is always 32 and the index
//! immediately follows the data segment, so the file length must equal
//! `IndexOffset + IndexSize`.
//!
//! Each data record is self-describing:
//!
//! ```text
//! [flags u8][marshal_type u8][key_len u32][key][value_len u32][value][crc32 u32]
//! ```
//!
//! - `flags` bit 0 marks a tombstone; a tombstone carries no value bytes.
//! - `marshal_type` names the codec the value was written with.
//! - The CRC32 covers every preceding byte of the record.
//!
//! Index entry `j` locates record `j`. Records are strictly increasing by
//! key, so a point lookup is a binary search over the index.
//!
//! # Sub-modules
//!
//! - [`builder`]: [`SstWriter`] streams a sorted source into a new file.
//! - [`iterator`]: [`TableIterator`] walks every record in key order.
//!
//! # Concurrency model
//!
//! Tables are immutable once renamed into place. The reader holds a
//! read-only mmap, so any number of threads may share one `SSTable`.
//!
//! # Integrity
//!
//! [`SSTable::open`] validates the header against the file length, every
//! index entry, every record checksum and the key order before returning.
//! Any mismatch fails closed with [`SSTableError::Corrupt`].

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod iterator;


// ------------------------------------------------------------------------------------------------
// Re-exports: public API surface
// ------------------------------------------------------------------------------------------------

pub use builder::SstWriter;
pub use iterator::TableIterator;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::File,
    io,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::encoding::{self, CodecRegistry, Decode, Encode, EncodingError, MarshalType};
use crate::engine::utils::PointEntry;
use crate::key::{HexKey, KeyOrder, Lexicographic};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Size of the fixed file header.
pub const SST_HDR_SIZE: usize = 32;

/// Size of one index entry.
pub const SST_INDEX_ENTRY_SIZE: usize = 16;

const SST_BLOOM_FILTER_FALSE_POSITIVE_RATE: f64 = 0.01;

const RECORD_FLAG_TOMBSTONE: u8 = 0b0000_0001;

/// flags + marshal_type + key_len
const RECORD_PREFIX_SIZE: usize = 1 + 1 + 4;

/// Smallest possible record: empty key, empty value.
const RECORD_MIN_SIZE: usize = RECORD_PREFIX_SIZE + 4 + 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, build).
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The file does not match the table format.
    #[error("Corrupt table: {0}")]
    Corrupt(String),

    /// The writer received a key that does not sort after its predecessor.
    #[error("Keys out of order at {0}")]
    OutOfOrder(String),

    /// The writer received no entries.
    #[error("Empty iterator cannot build SSTable")]
    Empty,

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn corrupt(msg: impl Into<String>) -> SSTableError {
    SSTableError::Corrupt(msg.into())
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// The 32-byte header at the start of every table file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableHeader {
    /// Absolute offset of the data segment.
    pub data_offset: u64,

    /// Length of the data segment in bytes.
    pub data_size: u64,

    /// Absolute offset of the index segment.
    pub index_offset: u64,

    /// Length of the index segment in bytes.
    pub index_size: u64,
}

/// Locates one data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Absolute file offset of the record.
    pub elem_offset: u64,

    /// Record length including its checksum.
    pub elem_size: u64,
}

impl Encode for TableHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.data_offset.encode_to(buf)?;
        self.data_size.encode_to(buf)?;
        self.index_offset.encode_to(buf)?;
        self.index_size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TableHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (data_offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (data_size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (index_offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (index_size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                data_offset,
                data_size,
                index_offset,
                index_size,
            },
            off,
        ))
    }
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.elem_offset.encode_to(buf)?;
        self.elem_size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (elem_offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (elem_size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                elem_offset,
                elem_size,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Data records
// ------------------------------------------------------------------------------------------------

/// Appends one framed record to `buf`. The value is passed through the
/// codec registered under `marshal_type`.
pub(crate) fn encode_record(
    buf: &mut Vec<u8>,
    entry: &PointEntry,
    registry: &CodecRegistry,
    marshal_type: MarshalType,
) -> Result<(), SSTableError> {
    let start = buf.len();

    let flags = if entry.is_tombstone() {
        RECORD_FLAG_TOMBSTONE
    } else {
        0
    };
    buf.push(flags);
    buf.push(marshal_type.0);
    encoding::marshal_u32(buf, encoding::len_to_u32(entry.key.len())?);
    buf.extend_from_slice(&entry.key);

    let len_pos = buf.len();
    encoding::marshal_u32(buf, 0);
    if let Some(value) = &entry.value {
        registry.marshal(buf, encoding::MarshalInput::Bytes(value), marshal_type)?;
    }
    let value_len = encoding::len_to_u32(buf.len() - len_pos - 4)?;
    buf[len_pos..len_pos + 4].copy_from_slice(&value_len.to_be_bytes());

    let mut hasher = Crc32::new();
    hasher.update(&buf[start..]);
    encoding::marshal_u32(buf, hasher.finalize());
    Ok(())
}

/// A record whose framing and checksum have been verified.
pub(crate) struct RawRecord<'a> {
    pub(crate) tombstone: bool,
    pub(crate) marshal_type: MarshalType,
    pub(crate) key: &'a [u8],
    pub(crate) value: &'a [u8],
}

/// Parses and verifies a single record occupying exactly `bytes`.
pub(crate) fn decode_record(bytes: &[u8]) -> Result<RawRecord<'_>, SSTableError> {
    if bytes.len() < RECORD_MIN_SIZE {
        return Err(corrupt(format!("record of {} bytes is too short", bytes.len())));
    }

    let body_len = bytes.len() - 4;
    let stored_crc = encoding::unmarshal_u32(&bytes[body_len..])?;
    let mut hasher = Crc32::new();
    hasher.update(&bytes[..body_len]);
    if hasher.finalize() != stored_crc {
        return Err(corrupt("record checksum mismatch"));
    }

    let flags = bytes[0];
    if flags & !RECORD_FLAG_TOMBSTONE != 0 {
        return Err(corrupt(format!("unknown record flags {flags:#04x}")));
    }
    let marshal_type = MarshalType(bytes[1]);

    let key_len = encoding::unmarshal_u32(&bytes[2..])? as usize;
    let key_end = RECORD_PREFIX_SIZE
        .checked_add(key_len)
        .filter(|&end| end + 4 <= body_len)
        .ok_or_else(|| corrupt("key length exceeds record"))?;
    let key = &bytes[RECORD_PREFIX_SIZE..key_end];

    let value_len = encoding::unmarshal_u32(&bytes[key_end..])? as usize;
    let value_start = key_end + 4;
    if value_start + value_len != body_len {
        return Err(corrupt("value length does not match record size"));
    }
    let tombstone = flags & RECORD_FLAG_TOMBSTONE != 0;
    if tombstone && value_len != 0 {
        return Err(corrupt("tombstone carries a value"));
    }

    Ok(RawRecord {
        tombstone,
        marshal_type,
        key,
        value: &bytes[value_start..body_len],
    })
}

// ------------------------------------------------------------------------------------------------
// Properties / GetResult
// ------------------------------------------------------------------------------------------------

/// Statistics collected while a table is validated on open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableProperties {
    /// Number of records, tombstones included.
    pub record_count: u64,

    /// Number of tombstone records.
    pub tombstone_count: u64,

    /// Smallest key, empty for a table without records.
    pub min_key: Vec<u8>,

    /// Largest key, empty for a table without records.
    pub max_key: Vec<u8>,

    /// Total file length in bytes.
    pub file_size: u64,
}

/// Result of a single key lookup in an SSTable.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum GetResult {
    /// A value stored in this table.
    Put(Vec<u8>),

    /// A tombstone for this key.
    Delete,

    /// This table has no information about the key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// SSTable: immutable reader
// ------------------------------------------------------------------------------------------------

/// A memory-mapped, validated, immutable table.
pub struct SSTable<O: KeyOrder = Lexicographic> {
    /// Location on disk.
    path: PathBuf,

    /// Memory-mapped file contents.
    mmap: Mmap,

    /// One entry per record, in key order.
    index: Vec<IndexEntry>,

    /// Built from every key (tombstones included) while validating.
    bloom: Bloom<[u8]>,

    /// Statistics gathered on open.
    properties: TableProperties,

    /// Codecs used to decode values.
    registry: Arc<CodecRegistry>,

    _order: PhantomData<O>,
}

impl<O: KeyOrder> SSTable<O> {
    /// Opens a table, validating its whole layout.
    ///
    /// # Errors
    ///
    /// - [`SSTableError::Io`] if the file cannot be opened or mapped.
    /// - [`SSTableError::Corrupt`] on any header, index or record mismatch,
    ///   a checksum failure, or keys that are not strictly increasing.
    /// - [`SSTableError::Encoding`] when a record names a codec `registry`
    ///   does not know.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { Mmap::map(...) }`. Tables are never modified after the
    /// rename that publishes them, and the map is read-only.
    pub fn open(
        path: impl AsRef<Path>,
        registry: Arc<CodecRegistry>,
    ) -> Result<Self, SSTableError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let file_len = mmap.len() as u64;

        if mmap.len() < SST_HDR_SIZE {
            return Err(corrupt(format!("file of {file_len} bytes has no header")));
        }
        let (header, _) = encoding::decode_from_slice::<TableHeader>(&mmap[..SST_HDR_SIZE])?;
        Self::validate_header(&header, file_len)?;

        let index = Self::load_index(&mmap, &header)?;

        let mut bloom = Bloom::new_for_fp_rate(index.len().max(1), SST_BLOOM_FILTER_FALSE_POSITIVE_RATE)
            .map_err(|e| SSTableError::Internal(e.to_string()))?;
        let mut properties = TableProperties {
            file_size: file_len,
            ..TableProperties::default()
        };

        let mut expected_offset = header.data_offset;
        let mut prev_key: Option<&[u8]> = None;
        for (j, entry) in index.iter().enumerate() {
            if entry.elem_offset != expected_offset {
                return Err(corrupt(format!(
                    "index entry {j} at offset {} breaks contiguity (expected {expected_offset})",
                    entry.elem_offset
                )));
            }
            expected_offset = entry
                .elem_offset
                .checked_add(entry.elem_size)
                .ok_or_else(|| corrupt("index entry overflows"))?;
            if expected_offset > header.index_offset {
                return Err(corrupt(format!("index entry {j} leaves the data segment")));
            }

            let record = decode_record(Self::slice(&mmap, entry)?)?;
            if !registry.contains(record.marshal_type) {
                return Err(EncodingError::UnsupportedType(format!(
                    "{} is not registered",
                    record.marshal_type
                ))
                .into());
            }
            if let Some(prev) = prev_key {
                if !O::less(prev, record.key) {
                    return Err(corrupt(format!(
                        "key {} does not follow {}",
                        HexKey(record.key),
                        HexKey(prev)
                    )));
                }
            }

            bloom.set(record.key);
            properties.record_count += 1;
            if record.tombstone {
                properties.tombstone_count += 1;
            }
            prev_key = Some(record.key);
        }
        if expected_offset != header.index_offset {
            return Err(corrupt("records do not cover the data segment"));
        }

        if let (Some(first), Some(last)) = (index.first(), index.last()) {
            properties.min_key = decode_record(Self::slice(&mmap, first)?)?.key.to_vec();
            properties.max_key = decode_record(Self::slice(&mmap, last)?)?.key.to_vec();
        }

        debug!(
            path = %path.display(),
            records = properties.record_count,
            tombstones = properties.tombstone_count,
            file_size = file_len,
            "SSTable opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            index,
            bloom,
            properties,
            registry,
            _order: PhantomData,
        })
    }

    fn validate_header(header: &TableHeader, file_len: u64) -> Result<(), SSTableError> {
        if header.data_offset != SST_HDR_SIZE as u64 {
            return Err(corrupt(format!(
                "data offset {} (expected {SST_HDR_SIZE})",
                header.data_offset
            )));
        }
        if header.data_offset.checked_add(header.data_size) != Some(header.index_offset) {
            return Err(corrupt("index segment does not follow the data segment"));
        }
        if header.index_offset.checked_add(header.index_size) != Some(file_len) {
            return Err(corrupt(format!(
                "segments end at {}+{} but file is {file_len} bytes",
                header.index_offset, header.index_size
            )));
        }
        if header.index_size % SST_INDEX_ENTRY_SIZE as u64 != 0 {
            return Err(corrupt(format!(
                "index size {} is not a multiple of {SST_INDEX_ENTRY_SIZE}",
                header.index_size
            )));
        }
        Ok(())
    }

    fn load_index(mmap: &Mmap, header: &TableHeader) -> Result<Vec<IndexEntry>, SSTableError> {
        let start = usize::try_from(header.index_offset)
            .map_err(|_| corrupt("index offset exceeds addressable range"))?;
        let bytes = mmap
            .get(start..)
            .ok_or_else(|| corrupt("index offset beyond end of file"))?;

        let mut index = Vec::with_capacity(bytes.len() / SST_INDEX_ENTRY_SIZE);
        for chunk in bytes.chunks_exact(SST_INDEX_ENTRY_SIZE) {
            let (entry, _) = IndexEntry::decode_from(chunk)?;
            if (entry.elem_size as usize) < RECORD_MIN_SIZE {
                return Err(corrupt(format!("index entry size {} too small", entry.elem_size)));
            }
            index.push(entry);
        }
        Ok(index)
    }

    /// Bytes of the record located by `entry`.
    fn slice<'m>(mmap: &'m Mmap, entry: &IndexEntry) -> Result<&'m [u8], SSTableError> {
        let start = usize::try_from(entry.elem_offset)
            .map_err(|_| corrupt("record offset exceeds addressable range"))?;
        let size = usize::try_from(entry.elem_size)
            .map_err(|_| corrupt("record size exceeds addressable range"))?;
        start
            .checked_add(size)
            .and_then(|end| mmap.get(start..end))
            .ok_or_else(|| corrupt("record out of range"))
    }

    pub(crate) fn record(&self, j: usize) -> Result<RawRecord<'_>, SSTableError> {
        let entry = self
            .index
            .get(j)
            .ok_or_else(|| SSTableError::Internal(format!("record {j} out of range")))?;
        decode_record(Self::slice(&self.mmap, entry)?)
    }

    pub(crate) fn decode_value(&self, record: &RawRecord<'_>) -> Result<Vec<u8>, SSTableError> {
        Ok(self
            .registry
            .unmarshal_bytes(record.value, record.marshal_type)?)
    }

    /// Looks up `key`.
    ///
    /// A key this table does not hold is [`GetResult::NotFound`], never an
    /// error.
    pub fn get(&self, key: &[u8]) -> Result<GetResult, SSTableError> {
        if !self.bloom.check(key) {
            trace!(key = %HexKey(key), path = %self.path.display(), "bloom filter negative");
            return Ok(GetResult::NotFound);
        }

        let mut lo = 0;
        let mut hi = self.index.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let record = self.record(mid)?;
            match O::compare(record.key, key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    return if record.tombstone {
                        Ok(GetResult::Delete)
                    } else {
                        Ok(GetResult::Put(self.decode_value(&record)?))
                    };
                }
            }
        }
        Ok(GetResult::NotFound)
    }

    /// Iterates every record in key order.
    pub fn iter(&self) -> TableIterator<'_, O> {
        TableIterator::new(self)
    }

    /// Returns `false` only when `key` is definitely absent.
    #[cfg(test)]
    pub(crate) fn bloom_may_contain(&self, key: &[u8]) -> bool {
        self.bloom.check(key)
    }

    /// Statistics gathered on open.
    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// `true` when the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// On-disk file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.properties.file_size
    }

    /// Path the table was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
