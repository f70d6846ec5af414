//! # Memory Management
//!
//! Allocation records, host-import fragments, the sub-4GB heap and the
//! temporary/reusable pools.

pub mod allocation;
pub mod cache;
pub mod fragment;
pub mod heap32;
pub mod index_list;

pub use allocation::{Allocation, AllocationId, CachePool};
pub use cache::AllocationCache;
pub use fragment::{split_host_range, Fragment, FragmentAcquire, FragmentRange, FragmentRegistry, OverlapStatus};
pub use heap32::Heap32;
pub use index_list::{IndexList, ListIndex};
