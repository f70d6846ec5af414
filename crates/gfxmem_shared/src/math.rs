//! # Alignment Math
//!
//! Power-of-two alignment helpers. All of them assume `alignment` is a
//! non-zero power of two; callers validate alignments at the API boundary.

use crate::constants::PAGE_SIZE;

/// Rounds `value` up to the next multiple of `alignment`.
#[inline]
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to a multiple of `alignment`.
#[inline]
#[must_use]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Returns true if `value` is a multiple of `alignment`.
#[inline]
#[must_use]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

/// Number of pages needed to hold `size` bytes.
#[inline]
#[must_use]
pub const fn page_count(size: u64) -> u64 {
    align_up(size, PAGE_SIZE) / PAGE_SIZE
}
