//! # GFXMEM Shared
//!
//! Plain vocabulary used by every layer of the memory core: engine ids,
//! fence values, memory pools, allocation kinds and page math.
//!
//! ## Rule
//!
//! Nothing in this crate locks, spawns, or allocates device memory. If a
//! type needs any of that it belongs in `gfxmem_core`.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod constants;
pub mod math;
pub mod types;

pub use constants::{
    FENCE_NEVER_USED, MAX_ENGINES, MAX_FRAGMENTS, PAGE_SIZE, TRIM_LIST_UNUSED_POSITION,
};
pub use math::{align_down, align_up, is_aligned, page_count};
pub use types::{AllocationKind, EngineId, FenceValue, MemoryPool};
