//! # Host-Pointer Fragments
//!
//! An imported host range is split into at most three page-aligned
//! fragments:
//!
//! ```text
//!        ptr                                           ptr + size
//!         │                                                 │
//!   ┌─────┼──────┬──────────────────────────────┬───────────┼─────┐
//!   │  leading   │          middle              │  trailing       │
//!   │ (1 page)   │    (whole pages, maybe 0)    │  (1 page)       │
//!   └────────────┴──────────────────────────────┴─────────────────┘
//! ```
//!
//! Unrelated imports may share pages, so fragments live in a registry
//! keyed by start address and are reference-counted. Before a new fragment
//! is created, every stored fragment is checked for overlap.

use super::allocation::raise_fence;
use crate::backend::{AllocationBackend, Backing};
use crate::error::DriverResult;
use gfxmem_shared::{align_down, is_aligned, EngineId, FenceValue, FENCE_NEVER_USED, MAX_FRAGMENTS, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// A page-aligned host address range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FragmentRange {
    /// First byte.
    pub address: u64,
    /// Length in bytes.
    pub size: u64,
}

impl FragmentRange {
    /// One past the last byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.address + self.size
    }

    /// True if the ranges share at least one byte. Adjacent ranges do not.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.address < other.end() && other.address < self.end()
    }

    /// True if `self` lies entirely inside `other`.
    #[inline]
    #[must_use]
    pub const fn is_within(&self, other: &Self) -> bool {
        self.address >= other.address && self.end() <= other.end()
    }
}

/// Splits `[ptr, ptr + size)` into page-aligned fragments.
///
/// Empty when `size` is zero or the page-aligned end of the range does
/// not fit in the address space.
///
/// # Examples
///
/// ```rust,ignore
/// // Unaligned start, shorter than a page: one leading fragment.
/// assert_eq!(split_host_range(0x1045, 200).len(), 1);
/// ```
#[must_use]
pub fn split_host_range(ptr: u64, size: u64) -> Vec<FragmentRange> {
    let mut fragments = Vec::with_capacity(MAX_FRAGMENTS);
    let Some(end) = ptr.checked_add(size) else {
        return fragments;
    };
    if size == 0 || end.checked_add(PAGE_SIZE - 1).is_none() {
        return fragments;
    }

    let mut start = ptr;

    if !is_aligned(ptr, PAGE_SIZE) {
        let page = align_down(ptr, PAGE_SIZE);
        fragments.push(FragmentRange { address: page, size: PAGE_SIZE });
        start = page + PAGE_SIZE;
    }

    let aligned_end = align_down(end, PAGE_SIZE);
    if aligned_end > start {
        fragments.push(FragmentRange { address: start, size: aligned_end - start });
    }

    if !is_aligned(end, PAGE_SIZE) && aligned_end >= start {
        fragments.push(FragmentRange { address: aligned_end, size: PAGE_SIZE });
    }

    fragments
}

/// How a requested fragment relates to the stored ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlapStatus {
    /// No stored fragment shares a byte with the request.
    NotOverlapping,
    /// A stored fragment has exactly the requested range.
    ExactMatch,
    /// The request lies inside a larger stored fragment.
    WithinStored,
    /// The request intersects a stored fragment but leaves it.
    BiggerThanStored,
}

impl OverlapStatus {
    /// True if the stored fragment can simply be shared.
    #[must_use]
    pub const fn is_reusable(self) -> bool {
        matches!(self, Self::ExactMatch | Self::WithinStored)
    }
}

#[derive(Debug)]
struct FragmentUsage {
    last_fence: AtomicU64,
    residency_count: AtomicU32,
}

/// A shared page range backing part of one or more imports.
#[derive(Debug)]
pub struct Fragment {
    range: FragmentRange,
    backing: Backing,
    holders: AtomicU32,
    usage: Box<[FragmentUsage]>,
}

impl Fragment {
    fn new(range: FragmentRange, backing: Backing, engine_count: usize) -> Self {
        let usage = (0..engine_count)
            .map(|_| FragmentUsage {
                last_fence: AtomicU64::new(FENCE_NEVER_USED),
                residency_count: AtomicU32::new(0),
            })
            .collect();
        Self { range, backing, holders: AtomicU32::new(1), usage }
    }

    /// Host range covered.
    #[inline]
    #[must_use]
    pub const fn range(&self) -> FragmentRange {
        self.range
    }

    /// First host address.
    #[inline]
    #[must_use]
    pub const fn address(&self) -> u64 {
        self.range.address
    }

    /// Size in bytes (page multiple).
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.range.size
    }

    /// Device handle created by the backend.
    #[inline]
    #[must_use]
    pub const fn backing(&self) -> Backing {
        self.backing
    }

    /// Live allocations referencing this fragment.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.holders.load(Ordering::Acquire)
    }

    /// Highest fence on `engine` recorded by any holder.
    #[must_use]
    pub fn last_fence(&self, engine: EngineId) -> FenceValue {
        self.usage[engine.index()].last_fence.load(Ordering::Acquire)
    }

    pub(crate) fn stamp_fence(&self, engine: EngineId, fence: FenceValue) {
        raise_fence(&self.usage[engine.index()].last_fence, fence);
    }

    /// Mapped allocations in the residency set of `engine` using this
    /// fragment.
    #[must_use]
    pub fn residency_count(&self, engine: EngineId) -> u32 {
        self.usage[engine.index()].residency_count.load(Ordering::Acquire)
    }

    /// Increments the residency count; returns true on the 0 -> 1 edge.
    pub(crate) fn acquire_residency(&self, engine: EngineId) -> bool {
        self.usage[engine.index()].residency_count.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Decrements the residency count; returns true on the 1 -> 0 edge.
    pub(crate) fn release_residency(&self, engine: EngineId) -> bool {
        let counter = &self.usage[engine.index()].residency_count;
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_ok_and(|previous| previous == 1)
    }
}

/// Result of trying to take fragments for an import.
#[derive(Debug)]
pub enum FragmentAcquire {
    /// Every requested range is covered; `reused` were shared.
    Acquired {
        /// One entry per requested range, in request order.
        fragments: Vec<Arc<Fragment>>,
        /// How many requested ranges reused a stored fragment.
        reused: usize,
    },
    /// A requested range partially overlaps a stored fragment.
    Conflict(FragmentRange),
}

/// Address-keyed registry of live fragments.
///
/// # Thread Safety
///
/// One mutex guards the map and every `holders` update, so classification
/// and acquisition are atomic with respect to each other.
#[derive(Debug)]
pub struct FragmentRegistry {
    fragments: Mutex<BTreeMap<u64, Arc<Fragment>>>,
    engine_count: usize,
}

impl FragmentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(engine_count: usize) -> Self {
        Self { fragments: Mutex::new(BTreeMap::new()), engine_count }
    }

    fn classify_locked(
        map: &BTreeMap<u64, Arc<Fragment>>,
        requested: &FragmentRange,
    ) -> (OverlapStatus, Option<Arc<Fragment>>) {
        // Stored fragments never overlap each other, so only the last one
        // starting before the request's end can intersect it.
        if let Some((_, stored)) = map.range(..requested.end()).next_back() {
            let stored_range = stored.range();
            if stored_range.end() > requested.address {
                let status = if stored_range == *requested {
                    OverlapStatus::ExactMatch
                } else if requested.is_within(&stored_range) {
                    OverlapStatus::WithinStored
                } else {
                    OverlapStatus::BiggerThanStored
                };
                return (status, Some(Arc::clone(stored)));
            }
        }
        (OverlapStatus::NotOverlapping, None)
    }

    /// Classifies `requested` against the stored fragments.
    #[must_use]
    pub fn classify(&self, requested: &FragmentRange) -> OverlapStatus {
        Self::classify_locked(&self.fragments.lock(), requested).0
    }

    /// Takes fragments covering `ranges`, sharing stored ones where
    /// possible and asking the backend for the rest.
    ///
    /// Nothing is modified when a conflict is reported.
    ///
    /// # Errors
    ///
    /// Propagates backend failures from `populate_fragments`.
    pub fn try_acquire(
        &self,
        ranges: &[FragmentRange],
        backend: &dyn AllocationBackend,
    ) -> DriverResult<FragmentAcquire> {
        let mut map = self.fragments.lock();

        let mut plan = Vec::with_capacity(ranges.len());
        for range in ranges {
            match Self::classify_locked(&map, range) {
                (OverlapStatus::BiggerThanStored, _) => return Ok(FragmentAcquire::Conflict(*range)),
                (status, stored) => plan.push((*range, status.is_reusable().then_some(stored).flatten())),
            }
        }

        let fresh: Vec<FragmentRange> = plan
            .iter()
            .filter(|(_, stored)| stored.is_none())
            .map(|(range, _)| *range)
            .collect();
        let mut backings = if fresh.is_empty() {
            Vec::new().into_iter()
        } else {
            backend.populate_fragments(&fresh)?.into_iter()
        };

        let mut fragments = Vec::with_capacity(plan.len());
        let mut reused = 0;
        for (range, stored) in plan {
            if let Some(stored) = stored {
                stored.holders.fetch_add(1, Ordering::AcqRel);
                fragments.push(stored);
                reused += 1;
            } else if let Some(backing) = backings.next() {
                let fragment = Arc::new(Fragment::new(range, backing, self.engine_count));
                map.insert(range.address, Arc::clone(&fragment));
                fragments.push(fragment);
            }
        }

        Ok(FragmentAcquire::Acquired { fragments, reused })
    }

    /// Drops one reference to `fragment`.
    ///
    /// Returns the backing to release once nobody references it.
    pub fn release(&self, fragment: &Fragment) -> Option<Backing> {
        let mut map = self.fragments.lock();
        let previous = fragment.holders.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            map.remove(&fragment.address());
            Some(fragment.backing())
        } else {
            None
        }
    }

    /// Reference count of the fragment starting at `address`.
    #[must_use]
    pub fn ref_count(&self, address: u64) -> Option<u32> {
        self.fragments.lock().get(&address).map(|f| f.ref_count())
    }

    /// Number of live fragments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fragments.lock().len()
    }

    /// True if no fragment is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;

    fn total(fragments: &[FragmentRange]) -> u64 {
        fragments.iter().map(|f| f.size).sum()
    }

    #[test]
    fn test_split_unaligned_within_one_page() {
        let fragments = split_host_range(0x1045, 200);
        assert_eq!(fragments, vec![FragmentRange { address: 0x1000, size: PAGE_SIZE }]);
    }

    #[test]
    fn test_split_unaligned_one_page_long() {
        let fragments = split_host_range(0x1045, 0x1000);
        assert_eq!(
            fragments,
            vec![
                FragmentRange { address: 0x1000, size: PAGE_SIZE },
                FragmentRange { address: 0x2000, size: PAGE_SIZE },
            ]
        );
    }

    #[test]
    fn test_split_leading_and_middle() {
        let fragments = split_host_range(0x1001, 0x9FFF);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0], FragmentRange { address: 0x1000, size: PAGE_SIZE });
        assert_eq!(fragments[1], FragmentRange { address: 0x2000, size: 9 * PAGE_SIZE });
    }

    #[test]
    fn test_split_three_fragments() {
        let fragments = split_host_range(0x1045, 0x9FFF);
        assert_eq!(fragments.len(), 3);
        assert_eq!(total(&fragments), 11 * PAGE_SIZE);
        assert_eq!(fragments[2].address, 0xB000);
    }

    #[test]
    fn test_split_aligned_is_middle_only() {
        let fragments = split_host_range(0x1000, 10 * PAGE_SIZE);
        assert_eq!(fragments, vec![FragmentRange { address: 0x1000, size: 10 * PAGE_SIZE }]);
    }

    #[test]
    fn test_split_wrapping_range_is_empty() {
        assert!(split_host_range(u64::MAX - 0x10, 0x100).is_empty());
        assert!(split_host_range(u64::MAX - 0x800, 0x100).is_empty());
        assert_eq!(split_host_range(u64::MAX - 0x1FFF, PAGE_SIZE).len(), 1);
    }

    #[test]
    fn test_adjacent_ranges_do_not_overlap() {
        let a = FragmentRange { address: 0x1000, size: 0x1000 };
        let b = FragmentRange { address: 0x2000, size: 0x1000 };
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&FragmentRange { address: 0x1FFF, size: 2 }));
    }

    #[test]
    fn test_classification() {
        let backend = HostBackend::new(1 << 24, 1 << 24);
        let registry = FragmentRegistry::new(1);
        let stored = FragmentRange { address: 0x4000, size: 0x3000 };
        assert!(matches!(
            registry.try_acquire(&[stored], &backend).unwrap(),
            FragmentAcquire::Acquired { reused: 0, .. }
        ));

        assert_eq!(registry.classify(&stored), OverlapStatus::ExactMatch);
        assert_eq!(
            registry.classify(&FragmentRange { address: 0x5000, size: 0x1000 }),
            OverlapStatus::WithinStored
        );
        assert_eq!(
            registry.classify(&FragmentRange { address: 0x6000, size: 0x2000 }),
            OverlapStatus::BiggerThanStored
        );
        assert_eq!(
            registry.classify(&FragmentRange { address: 0x3000, size: 0x1000 }),
            OverlapStatus::NotOverlapping
        );
        assert_eq!(
            registry.classify(&FragmentRange { address: 0x7000, size: 0x1000 }),
            OverlapStatus::NotOverlapping
        );
    }

    #[test]
    fn test_shared_fragment_survives_first_release() {
        let backend = HostBackend::new(1 << 24, 1 << 24);
        let registry = FragmentRegistry::new(1);
        let range = FragmentRange { address: 0x8000, size: 0x1000 };

        let FragmentAcquire::Acquired { fragments: first, .. } = registry.try_acquire(&[range], &backend).unwrap() else {
            panic!("expected acquisition");
        };
        let FragmentAcquire::Acquired { fragments: second, reused } = registry.try_acquire(&[range], &backend).unwrap() else {
            panic!("expected acquisition");
        };
        assert_eq!(reused, 1);
        assert_eq!(registry.ref_count(0x8000), Some(2));

        assert!(registry.release(&first[0]).is_none());
        assert_eq!(registry.ref_count(0x8000), Some(1));
        assert!(registry.release(&second[0]).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_conflict_leaves_registry_untouched() {
        let backend = HostBackend::new(1 << 24, 1 << 24);
        let registry = FragmentRegistry::new(1);
        let stored = FragmentRange { address: 0x2000, size: 0x1000 };
        registry.try_acquire(&[stored], &backend).unwrap();

        let request = [
            FragmentRange { address: 0x10_0000, size: 0x1000 },
            FragmentRange { address: 0x1000, size: 0x3000 },
        ];
        let outcome = registry.try_acquire(&request, &backend).unwrap();
        assert!(matches!(outcome, FragmentAcquire::Conflict(r) if r.address == 0x1000));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ref_count(0x2000), Some(1));
    }

    #[test]
    fn test_residency_count_edges() {
        let backend = HostBackend::new(1 << 24, 1 << 24);
        let registry = FragmentRegistry::new(1);
        let FragmentAcquire::Acquired { fragments, .. } = registry
            .try_acquire(&[FragmentRange { address: 0x1000, size: 0x1000 }], &backend)
            .unwrap()
        else {
            panic!("expected acquisition");
        };
        let fragment = &fragments[0];
        let e = EngineId(0);

        assert!(fragment.acquire_residency(e));
        assert!(!fragment.acquire_residency(e));
        assert!(!fragment.release_residency(e));
        assert!(fragment.release_residency(e));
        assert!(!fragment.release_residency(e));
        assert_eq!(fragment.residency_count(e), 0);
    }
}
