//! Pointer-width abstraction.
//!
//! The original analyzer templates nearly every type on the target's pointer width (32 vs
//! 64 bit offsets). Rather than macro-duplicating `Directory`/`Graph`/`Distances` per width,
//! those types are generic over a single [`Word`] implementation, so one binary can analyze
//! snapshots of either bitness.

use std::fmt::{Debug, LowerHex};
use std::hash::Hash;

/// An address / offset value in the target process, generic over pointer width.
pub trait Word:
    Copy + Clone + Eq + Ord + Hash + Debug + LowerHex + Send + Sync + 'static
{
    /// Size of a pointer-aligned word, in bytes.
    const BYTES: usize;

    fn from_u64(v: u64) -> Self;
    fn as_u64(self) -> u64;

    #[inline]
    fn as_usize(self) -> usize {
        self.as_u64() as usize
    }

    #[inline]
    fn checked_add(self, rhs: u64) -> Option<Self> {
        self.as_u64().checked_add(rhs).map(Self::from_u64)
    }

    #[inline]
    fn saturating_sub(self, rhs: Self) -> u64 {
        self.as_u64().saturating_sub(rhs.as_u64())
    }

    #[inline]
    fn is_aligned(self) -> bool {
        self.as_u64() % (Self::BYTES as u64) == 0
    }
}

impl Word for u32 {
    const BYTES: usize = 4;

    #[inline]
    fn from_u64(v: u64) -> Self {
        v as u32
    }

    #[inline]
    fn as_u64(self) -> u64 {
        self as u64
    }
}

impl Word for u64 {
    const BYTES: usize = 8;

    #[inline]
    fn from_u64(v: u64) -> Self {
        v
    }

    #[inline]
    fn as_u64(self) -> u64 {
        self
    }
}
