//! SSTable writer: builds a complete table file from a sorted stream.
//!
//! # Input Requirements
//!
//! Entries must be strictly increasing by key under the writer's
//! [`KeyOrder`]. A duplicate or out-of-order key aborts the build with
//! [`SSTableError::OutOfOrder`].
//!
//! # Atomicity
//!
//! 1. Write a zeroed header placeholder to `path.tmp`.
//! 2. Stream data records, then the index.
//! 3. Seek back, write the real header, flush and `fsync`.
//! 4. Rename `path.tmp` → `path`, then `fsync` the parent directory so
//!    the new name is durable before the caller unlinks anything it
//!    replaces.
//!
//! A failed build removes the temp file, so the final path either holds a
//! complete table or does not exist.

use std::{
    fs::{self, File, OpenOptions, rename},
    io::{BufWriter, Seek, SeekFrom, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::encoding::{CodecRegistry, Encode, MarshalType};
use crate::engine::utils::PointEntry;
use crate::key::{HexKey, KeyOrder, Lexicographic};

use super::{IndexEntry, SST_HDR_SIZE, SSTableError, TableHeader, encode_record};

// ------------------------------------------------------------------------------------------------
// SstWriter: public entry point
// ------------------------------------------------------------------------------------------------

/// Builds a complete SSTable file on disk.
///
/// # Example
///
/// ```rust,ignore
/// SstWriter::<Lexicographic>::new(&path, registry).build(entries)?;
/// ```
pub struct SstWriter<O: KeyOrder = Lexicographic> {
    path: PathBuf,
    registry: Arc<CodecRegistry>,
    marshal_type: MarshalType,
    _order: PhantomData<O>,
}

impl<O: KeyOrder> SstWriter<O> {
    /// Create a writer targeting `path`, encoding values uncompressed.
    pub fn new(path: impl AsRef<Path>, registry: Arc<CodecRegistry>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            registry,
            marshal_type: MarshalType::UNCOMPRESSED,
            _order: PhantomData,
        }
    }

    /// Encode values with the codec registered under `marshal_type`.
    pub fn with_marshal_type(mut self, marshal_type: MarshalType) -> Self {
        self.marshal_type = marshal_type;
        self
    }

    /// Consume a sorted stream and write a complete SSTable.
    ///
    /// Returns the header that was written.
    ///
    /// # Errors
    ///
    /// - [`SSTableError::Empty`] if the stream yields nothing.
    /// - [`SSTableError::OutOfOrder`] on a non-increasing key.
    /// - [`SSTableError::Encoding`] when the codec rejects a value.
    /// - I/O errors from writing, syncing or renaming.
    pub fn build(
        self,
        entries: impl IntoIterator<Item = PointEntry>,
    ) -> Result<TableHeader, SSTableError> {
        self.try_build(entries.into_iter().map(Ok))
    }

    /// Like [`SstWriter::build`], for sources that can fail mid-stream.
    ///
    /// The first `Err` aborts the build; nothing is published.
    pub fn try_build(
        self,
        entries: impl IntoIterator<Item = Result<PointEntry, SSTableError>>,
    ) -> Result<TableHeader, SSTableError> {
        let final_path = self.path.as_path();
        let tmp_path = final_path.with_extension("tmp");

        let result = self.write_tmp(&tmp_path, entries.into_iter());
        let header = match result {
            Ok(header) => header,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&tmp_path) {
                    warn!(path = %tmp_path.display(), error = %rm, "failed to remove temp SSTable");
                }
                return Err(e);
            }
        };

        rename(&tmp_path, final_path)?;
        fsync_parent_dir(final_path)?;

        debug!(
            path = %final_path.display(),
            records = header.index_size / super::SST_INDEX_ENTRY_SIZE as u64,
            data_size = header.data_size,
            "SSTable written"
        );
        Ok(header)
    }

    fn write_tmp(
        &self,
        tmp_path: &Path,
        entries: impl Iterator<Item = Result<PointEntry, SSTableError>>,
    ) -> Result<TableHeader, SSTableError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut writer = BufWriter::new(&mut file);

        // 1. Header placeholder
        writer.write_all(&[0u8; SST_HDR_SIZE])?;

        // 2. Data records
        let index = self.write_records(&mut writer, entries)?;
        let data_size = index
            .last()
            .map_or(0, |e| e.elem_offset + e.elem_size - SST_HDR_SIZE as u64);

        // 3. Index
        let mut index_bytes = Vec::with_capacity(index.len() * super::SST_INDEX_ENTRY_SIZE);
        for entry in &index {
            entry.encode_to(&mut index_bytes)?;
        }
        writer.write_all(&index_bytes)?;

        // 4. Real header
        let header = TableHeader {
            data_offset: SST_HDR_SIZE as u64,
            data_size,
            index_offset: SST_HDR_SIZE as u64 + data_size,
            index_size: index_bytes.len() as u64,
        };
        let mut header_bytes = Vec::with_capacity(SST_HDR_SIZE);
        header.encode_to(&mut header_bytes)?;
        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(&header_bytes)?;

        writer.flush()?;
        drop(writer);
        file.sync_all()?;

        Ok(header)
    }

    fn write_records(
        &self,
        writer: &mut impl Write,
        entries: impl Iterator<Item = Result<PointEntry, SSTableError>>,
    ) -> Result<Vec<IndexEntry>, SSTableError> {
        let mut index = Vec::new();
        let mut offset = SST_HDR_SIZE as u64;
        let mut prev_key: Option<Vec<u8>> = None;
        let mut buf = Vec::new();

        for entry in entries {
            let entry = entry?;
            if let Some(prev) = &prev_key {
                if !O::less(prev, &entry.key) {
                    return Err(SSTableError::OutOfOrder(format!(
                        "{} after {}",
                        HexKey(&entry.key),
                        HexKey(prev)
                    )));
                }
            }

            buf.clear();
            encode_record(&mut buf, &entry, &self.registry, self.marshal_type)?;
            writer.write_all(&buf)?;

            index.push(IndexEntry {
                elem_offset: offset,
                elem_size: buf.len() as u64,
            });
            offset += buf.len() as u64;
            prev_key = Some(entry.key);
        }

        if index.is_empty() {
            return Err(SSTableError::Empty);
        }
        Ok(index)
    }
}

/// Makes a rename inside the parent directory durable.
fn fsync_parent_dir(path: &Path) -> Result<(), SSTableError> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}
