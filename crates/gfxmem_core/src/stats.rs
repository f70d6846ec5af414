//! # Memory Statistics
//!
//! Counters snapshotted by [`MemoryManager::stats`](crate::MemoryManager::stats).

/// Lifetime counters of a memory manager.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Allocations served by the backend.
    pub fresh_allocations: u64,
    /// Allocations served from the reusable pool.
    pub reused_allocations: u64,
    /// Host-pointer imports completed.
    pub imports: u64,
    /// Import fragments that shared a stored fragment.
    pub fragments_reused: u64,
    /// Overlap resolution steps taken by imports.
    pub overlap_resolutions: u64,
    /// Allocations freed (immediately or deferred).
    pub frees: u64,
    /// Releases handed to the deferred deleter.
    pub deferred_deletions: u64,
    /// Releases parked in the temporary pool.
    pub temporary_stores: u64,
    /// Allocation retries after draining deferred deletions.
    pub oom_retries: u64,
    /// Evictions across all residency sets.
    pub evictions: u64,
    /// Bytes evicted across all residency sets.
    pub bytes_evicted: u64,
}
