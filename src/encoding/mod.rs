//! Fixed-width big-endian binary codec and the marshal-type registry.
//!
//! Two layers live here:
//!
//! - The [`Encode`] / [`Decode`] traits and the `marshal_*` / `unmarshal_*`
//!   helpers: deterministic, append-style primitives used for every
//!   integer written to an SSTable.
//! - The [`CodecRegistry`]: a table keyed by a one-byte [`MarshalType`]
//!   tag that selects how byte payloads (record values) are encoded.
//!   Tag `0` is the uncompressed passthrough. New encodings (for example
//!   a compression codec) are added by registering another [`Codec`],
//!   without touching call sites.
//!
//! # Wire format
//!
//! | Rust type          | Encoding                                     |
//! |--------------------|----------------------------------------------|
//! | `u8`               | 1 byte                                       |
//! | `u32`              | 4 bytes, big-endian                          |
//! | `u64`              | 8 bytes, big-endian                          |
//! | `[u8; N]`          | `N` raw bytes (fixed-size, no length prefix) |
//! | `Vec<u8>` / bytes  | `[u32 len][bytes]`                           |
//!
//! # Zero-panic guarantee
//!
//! Decoders never index past the end of their input. A short slice yields
//! [`EncodingError::UnexpectedEof`].


use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Safety limits
// ------------------------------------------------------------------------------------------------

/// Maximum byte length for a single length-prefixed `Vec<u8>` during
/// decoding (256 MiB).
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The marshal type is not registered, or its codec cannot encode the
    /// given input.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A length exceeded its safety limit or the wire format.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer.
///
/// Implementations must be deterministic: the same value always yields
/// the same bytes.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can advance a cursor.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Convert a `usize` length to `u32`, failing if it does not fit.
#[inline]
pub(crate) fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

// ------------------------------------------------------------------------------------------------
// Fixed-width integer primitives
// ------------------------------------------------------------------------------------------------

/// Appends `value` as 4 big-endian bytes.
#[inline]
pub fn marshal_u32(dst: &mut Vec<u8>, value: u32) {
    dst.extend_from_slice(&value.to_be_bytes());
}

/// Reads a big-endian `u32` from the first 4 bytes of `src`.
#[inline]
pub fn unmarshal_u32(src: &[u8]) -> Result<u32, EncodingError> {
    require(src, 4)?;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&src[..4]);
    Ok(u32::from_be_bytes(bytes))
}

/// Appends `value` as 8 big-endian bytes.
#[inline]
pub fn marshal_u64(dst: &mut Vec<u8>, value: u64) {
    dst.extend_from_slice(&value.to_be_bytes());
}

/// Reads a big-endian `u64` from the first 8 bytes of `src`.
#[inline]
pub fn unmarshal_u64(src: &[u8]) -> Result<u64, EncodingError> {
    require(src, 8)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&src[..8]);
    Ok(u64::from_be_bytes(bytes))
}

impl Encode for u8 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        Ok((buf[0], 1))
    }
}

impl Encode for u32 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        marshal_u32(buf, *self);
        Ok(())
    }
}

impl Decode for u32 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        Ok((unmarshal_u32(buf)?, 4))
    }
}

impl Encode for u64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        marshal_u64(buf, *self);
        Ok(())
    }
}

impl Decode for u64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        Ok((unmarshal_u64(buf)?, 8))
    }
}

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(&buf[..N]);
        Ok((arr, N))
    }
}

// ------------------------------------------------------------------------------------------------
// Variable-length byte vectors: [u32 len][bytes]
// ------------------------------------------------------------------------------------------------

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_slice().encode_to(buf)
    }
}

impl Encode for &[u8] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        marshal_u32(buf, len_to_u32(self.len())?);
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, offset) = u32::decode_from(buf)?;
        if len > MAX_BYTE_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "byte vector length {len} exceeds MAX_BYTE_LEN ({MAX_BYTE_LEN})"
            )));
        }
        let len = len as usize;
        require(&buf[offset..], len)?;
        Ok((buf[offset..offset + len].to_vec(), offset + len))
    }
}

// ------------------------------------------------------------------------------------------------
// Marshal types and codecs
// ------------------------------------------------------------------------------------------------

/// One-byte tag selecting a registered [`Codec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarshalType(pub u8);

impl MarshalType {
    /// Uncompressed passthrough: bytes are copied verbatim.
    pub const UNCOMPRESSED: MarshalType = MarshalType(0);
}

impl Default for MarshalType {
    fn default() -> Self {
        Self::UNCOMPRESSED
    }
}

impl fmt::Display for MarshalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "marshal-type-{}", self.0)
    }
}

/// A value handed to [`CodecRegistry::marshal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalInput<'a> {
    /// An opaque byte string.
    Bytes(&'a [u8]),
    /// A 32-bit unsigned integer.
    U32(u32),
    /// A 64-bit unsigned integer.
    U64(u64),
}

impl MarshalInput<'_> {
    /// Short name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            MarshalInput::Bytes(_) => "bytes",
            MarshalInput::U32(_) => "u32",
            MarshalInput::U64(_) => "u64",
        }
    }
}

/// An encoder/decoder pair registered under a [`MarshalType`].
pub trait Codec: Send + Sync {
    /// Appends the encoded form of `input` to `dst`.
    ///
    /// Returns [`EncodingError::UnsupportedType`] for inputs the codec
    /// does not handle.
    fn marshal(&self, dst: &mut Vec<u8>, input: MarshalInput<'_>) -> Result<(), EncodingError>;

    /// Inverse of [`Codec::marshal`] for [`MarshalInput::Bytes`].
    fn unmarshal_bytes(&self, src: &[u8]) -> Result<Vec<u8>, EncodingError>;
}

/// The uncompressed passthrough codec (tag `0`).
///
/// Byte strings are copied verbatim; integers are written big-endian at
/// fixed width.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Codec for Passthrough {
    fn marshal(&self, dst: &mut Vec<u8>, input: MarshalInput<'_>) -> Result<(), EncodingError> {
        match input {
            MarshalInput::Bytes(bytes) => dst.extend_from_slice(bytes),
            MarshalInput::U32(v) => marshal_u32(dst, v),
            MarshalInput::U64(v) => marshal_u64(dst, v),
        }
        Ok(())
    }

    fn unmarshal_bytes(&self, src: &[u8]) -> Result<Vec<u8>, EncodingError> {
        Ok(src.to_vec())
    }
}

/// Registry of codecs keyed by [`MarshalType`].
///
/// Constructed explicitly and injected into the engine, so tests and
/// separate engines may use independent registries.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<MarshalType, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Creates a registry with [`Passthrough`] registered at
    /// [`MarshalType::UNCOMPRESSED`].
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(MarshalType::UNCOMPRESSED, Arc::new(Passthrough));
        registry
    }

    /// Creates a registry with no codecs at all.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registers `codec` under `tag`, returning the codec it replaced.
    pub fn register(&mut self, tag: MarshalType, codec: Arc<dyn Codec>) -> Option<Arc<dyn Codec>> {
        self.codecs.insert(tag, codec)
    }

    /// Returns `true` if a codec is registered under `tag`.
    pub fn contains(&self, tag: MarshalType) -> bool {
        self.codecs.contains_key(&tag)
    }

    fn codec(&self, tag: MarshalType) -> Result<&Arc<dyn Codec>, EncodingError> {
        self.codecs
            .get(&tag)
            .ok_or_else(|| EncodingError::UnsupportedType(format!("{tag} is not registered")))
    }

    /// Appends `input` to `dst` using the codec registered under `tag`.
    pub fn marshal(
        &self,
        dst: &mut Vec<u8>,
        input: MarshalInput<'_>,
        tag: MarshalType,
    ) -> Result<(), EncodingError> {
        self.codec(tag)?.marshal(dst, input)
    }

    /// Decodes a byte payload written by [`CodecRegistry::marshal`].
    pub fn unmarshal_bytes(&self, src: &[u8], tag: MarshalType) -> Result<Vec<u8>, EncodingError> {
        self.codec(tag)?.unmarshal_bytes(src)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.codecs.keys().map(|t| t.0).collect();
        tags.sort_unstable();
        f.debug_struct("CodecRegistry").field("tags", &tags).finish()
    }
}
