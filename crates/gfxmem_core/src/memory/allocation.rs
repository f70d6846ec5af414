//! # Allocation Records
//!
//! An [`Allocation`] is the driver's view of one memory resource handed to
//! the device. It is shared as `Arc<Allocation>` between the caller, the
//! pools, the residency sets and the deferred deleter.
//!
//! ## Ownership
//!
//! A plain allocation owns exactly one [`Backing`]. An imported allocation
//! owns no backing of its own: it is the union of 1 to 3 shared
//! [`Fragment`]s, each reference-counted by the fragment registry.
//!
//! ## Mutation Rules
//!
//! | Field              | Written by                          |
//! |--------------------|-------------------------------------|
//! | `last_fence[e]`    | submission path owning engine `e`   |
//! | `resident[e]`      | residency set `e`, under its lock   |
//! | `trim_position[e]` | residency set `e`, under its lock   |
//! | `cache_link`       | allocation cache, under a pool lock |
//!
//! Fences are read lock-free.

use super::fragment::Fragment;
use super::index_list::ListIndex;
use crate::backend::Backing;
use gfxmem_shared::{
    AllocationKind, EngineId, FenceValue, MemoryPool, FENCE_NEVER_USED, TRIM_LIST_UNUSED_POSITION,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Opaque allocation identity. Never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationId(pub u64);

/// Pool an allocation is parked in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePool {
    /// Waiting for its fences to retire before being freed.
    Temporary,
    /// Available for reuse by `acquire`.
    Reusable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CacheLink {
    pub pool: CachePool,
    pub index: ListIndex,
}

/// Per-engine usage and residency state.
#[derive(Debug)]
struct EngineUsage {
    last_fence: AtomicU64,
    resident: AtomicBool,
    trim_position: AtomicUsize,
}

impl Default for EngineUsage {
    fn default() -> Self {
        Self {
            last_fence: AtomicU64::new(FENCE_NEVER_USED),
            resident: AtomicBool::new(false),
            trim_position: AtomicUsize::new(TRIM_LIST_UNUSED_POSITION),
        }
    }
}

/// Raises `slot` to `fence`, treating the never-used sentinel as lowest.
pub(crate) fn raise_fence(slot: &AtomicU64, fence: FenceValue) {
    let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        (current == FENCE_NEVER_USED || fence > current).then_some(fence)
    });
}

/// One memory resource tracked by the core.
#[derive(Debug)]
pub struct Allocation {
    id: AllocationId,
    size: u64,
    aligned_size: u64,
    kind: AllocationKind,
    pool: MemoryPool,
    is_32bit: bool,
    gpu_address: u64,
    host_address: Option<u64>,
    backing: Option<Backing>,
    fragments: Vec<Arc<Fragment>>,
    usage: Box<[EngineUsage]>,
    cache_link: Mutex<Option<CacheLink>>,
}

impl Allocation {
    /// Creates an allocation owning a single backing.
    ///
    /// # Arguments
    ///
    /// * `size` - Bytes requested by the caller
    /// * `backing` - Memory reserved by the backend (page-aligned size)
    /// * `is_32bit` - Whether the GPU address lies in the 32-bit heap
    /// * `engine_count` - Engines tracked for fences and residency
    #[must_use]
    pub fn new(
        id: AllocationId,
        size: u64,
        kind: AllocationKind,
        backing: Backing,
        is_32bit: bool,
        engine_count: usize,
    ) -> Self {
        Self {
            id,
            size,
            aligned_size: backing.size,
            kind,
            pool: kind.pool(),
            is_32bit,
            gpu_address: backing.gpu_address,
            host_address: None,
            backing: Some(backing),
            fragments: Vec::new(),
            usage: (0..engine_count).map(|_| EngineUsage::default()).collect(),
            cache_link: Mutex::new(None),
        }
    }

    /// Creates an imported allocation made of shared fragments.
    #[must_use]
    pub fn imported(
        id: AllocationId,
        host_address: u64,
        size: u64,
        fragments: Vec<Arc<Fragment>>,
        engine_count: usize,
    ) -> Self {
        let aligned_size = fragments.iter().map(|f| f.size()).sum();
        let gpu_address = fragments.first().map_or(0, |f| f.backing().gpu_address);
        Self {
            id,
            size,
            aligned_size,
            kind: AllocationKind::HostImport,
            pool: MemoryPool::Shared,
            is_32bit: false,
            gpu_address,
            host_address: Some(host_address),
            backing: None,
            fragments,
            usage: (0..engine_count).map(|_| EngineUsage::default()).collect(),
            cache_link: Mutex::new(None),
        }
    }

    /// Overrides the GPU address (32-bit heap placement).
    #[must_use]
    pub fn with_gpu_address(mut self, gpu_address: u64) -> Self {
        self.gpu_address = gpu_address;
        self
    }

    /// Identity.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> AllocationId {
        self.id
    }

    /// Bytes requested by the caller.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Page-aligned bytes the allocation occupies; what the budget counts.
    #[inline]
    #[must_use]
    pub const fn aligned_size(&self) -> u64 {
        self.aligned_size
    }

    /// Usage kind.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> AllocationKind {
        self.kind
    }

    /// Memory pool.
    #[inline]
    #[must_use]
    pub const fn pool(&self) -> MemoryPool {
        self.pool
    }

    /// True if addressable with 32 bits.
    #[inline]
    #[must_use]
    pub const fn is_32bit(&self) -> bool {
        self.is_32bit
    }

    /// GPU virtual address.
    #[inline]
    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// Application pointer for imports.
    #[inline]
    #[must_use]
    pub const fn host_address(&self) -> Option<u64> {
        self.host_address
    }

    /// Owned backing; `None` for fragmented imports.
    #[inline]
    #[must_use]
    pub const fn backing(&self) -> Option<Backing> {
        self.backing
    }

    /// Fragments of an import; empty otherwise.
    #[inline]
    #[must_use]
    pub fn fragments(&self) -> &[Arc<Fragment>] {
        &self.fragments
    }

    /// True if made of fragments.
    #[inline]
    #[must_use]
    pub fn is_fragmented(&self) -> bool {
        !self.fragments.is_empty()
    }

    /// Highest fence on `engine` that must retire before reuse.
    #[inline]
    #[must_use]
    pub fn last_fence(&self, engine: EngineId) -> FenceValue {
        self.usage[engine.index()].last_fence.load(Ordering::Acquire)
    }

    /// True if ever submitted on any engine.
    #[must_use]
    pub fn was_used(&self) -> bool {
        self.usage
            .iter()
            .any(|u| u.last_fence.load(Ordering::Acquire) != FENCE_NEVER_USED)
    }

    /// Raises the last-use fence on `engine` to `fence`, fragments included.
    pub(crate) fn stamp_fence(&self, engine: EngineId, fence: FenceValue) {
        raise_fence(&self.usage[engine.index()].last_fence, fence);
        for fragment in &self.fragments {
            fragment.stamp_fence(engine, fence);
        }
    }

    /// True if mapped in the residency set of `engine`.
    #[inline]
    #[must_use]
    pub fn is_resident(&self, engine: EngineId) -> bool {
        self.usage[engine.index()].resident.load(Ordering::Acquire)
    }

    pub(crate) fn set_resident(&self, engine: EngineId, resident: bool) {
        self.usage[engine.index()].resident.store(resident, Ordering::Release);
    }

    /// Index in the trim-candidate list of `engine`, if any.
    #[must_use]
    pub fn trim_position(&self, engine: EngineId) -> Option<usize> {
        let position = self.usage[engine.index()].trim_position.load(Ordering::Acquire);
        (position != TRIM_LIST_UNUSED_POSITION).then_some(position)
    }

    pub(crate) fn set_trim_position(&self, engine: EngineId, position: usize) {
        self.usage[engine.index()].trim_position.store(position, Ordering::Release);
    }

    /// Pool currently holding the allocation.
    #[must_use]
    pub fn cache_pool(&self) -> Option<CachePool> {
        self.cache_link.lock().map(|link| link.pool)
    }

    pub(crate) fn cache_link(&self) -> Option<CacheLink> {
        *self.cache_link.lock()
    }

    pub(crate) fn set_cache_link(&self, link: Option<CacheLink>) {
        *self.cache_link.lock() = link;
    }

    /// Backings the device must map to make this allocation resident.
    #[must_use]
    pub fn residency_units(&self) -> Vec<Backing> {
        match self.backing {
            Some(backing) => vec![backing],
            None => self.fragments.iter().map(|f| f.backing()).collect(),
        }
    }
}
