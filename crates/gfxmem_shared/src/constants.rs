//! # Memory Core Constants
//!
//! Values baked into the core. Changing them changes fragment layout and
//! budget accounting, so treat them as ABI.

use crate::types::FenceValue;

// =============================================================================
// PAGING
// =============================================================================

/// Host page size used for fragment splitting and budget accounting.
pub const PAGE_SIZE: u64 = 4096;

/// Maximum fragments a host-pointer import may be split into
/// (leading partial page, middle full pages, trailing partial page).
pub const MAX_FRAGMENTS: usize = 3;

// =============================================================================
// ENGINES & FENCES
// =============================================================================

/// Upper bound on engines a single device may expose.
pub const MAX_ENGINES: usize = 16;

/// Fence value of an allocation that was never submitted on an engine.
///
/// Treated as retired everywhere: nothing on the device can reference it.
pub const FENCE_NEVER_USED: FenceValue = u64::MAX;

// =============================================================================
// RESIDENCY
// =============================================================================

/// Trim-list position of an allocation that is not a trim candidate.
pub const TRIM_LIST_UNUSED_POSITION: usize = usize::MAX;
