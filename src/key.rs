//! Key ordering.
//!
//! Every sorted structure in the crate (skip list, SSTable index, merge
//! iterator) orders keys through a [`KeyOrder`] chosen at compile time.
//! The order is a zero-sized type parameter, so comparisons are statically
//! dispatched and two structures with different orders cannot be mixed.

use std::cmp::Ordering;
use std::fmt;

/// A static total order over byte-string keys.
pub trait KeyOrder: Send + Sync + 'static {
    /// Compares two keys.
    fn compare(a: &[u8], b: &[u8]) -> Ordering;

    /// Returns `true` when `a` sorts strictly before `b`.
    #[inline]
    fn less(a: &[u8], b: &[u8]) -> bool {
        Self::compare(a, b) == Ordering::Less
    }
}

/// Unsigned byte-wise lexicographic order.
///
/// A proper prefix sorts before every longer key that extends it
/// (`"a" < "ab" < "b"`). Keys of equal content and length are equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lexicographic;

impl KeyOrder for Lexicographic {
    #[inline]
    fn compare(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

// ------------------------------------------------------------------------------------------------
// Tracing Helper
// ------------------------------------------------------------------------------------------------

/// Hex rendering of a key for log fields. Long keys are truncated.
pub(crate) struct HexKey<'a>(pub(crate) &'a [u8]);

impl fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{:02x}", byte)?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{:02x}", byte)?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
