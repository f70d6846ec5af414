//! # Allocation Cache
//!
//! Two pools of parked allocations:
//!
//! - `temporary`: released while the device may still use them; freed by
//!   [`AllocationCache::reclaim`] once their fences retire.
//! - `reusable`: handed back by callers for recycling; served by
//!   [`AllocationCache::detach_best_fit`].
//!
//! Each pool is an [`IndexList`] behind its own mutex. The allocation
//! remembers its pool and slot, so removal by handle is O(1).
//!
//! ## Reuse Policy
//!
//! Lookup scans `reusable` from the head and returns the FIRST entry with
//! matching bitness, enough capacity and no pending work. It is not a
//! tightest-fit search.

use super::allocation::{Allocation, CacheLink, CachePool};
use super::index_list::IndexList;
use crate::sync::FenceTracker;
use gfxmem_shared::{EngineId, FenceValue, FENCE_NEVER_USED};
use parking_lot::Mutex;
use std::sync::Arc;

type Pool = Mutex<IndexList<Arc<Allocation>>>;

/// Temporary and reusable allocation pools.
///
/// # Thread Safety
///
/// Every operation locks only the pool it touches. Entries are fully
/// linked before the lock is released, so `reclaim` never observes a
/// half-inserted allocation.
#[derive(Debug, Default)]
pub struct AllocationCache {
    reusable: Pool,
    temporary: Pool,
}

impl AllocationCache {
    /// Creates empty pools.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, pool: CachePool) -> &Pool {
        match pool {
            CachePool::Reusable => &self.reusable,
            CachePool::Temporary => &self.temporary,
        }
    }

    fn push(&self, pool: CachePool, allocation: Arc<Allocation>) {
        self.detach(&allocation);
        let mut list = self.pool(pool).lock();
        let link_target = Arc::clone(&allocation);
        let index = list.push_back(allocation);
        link_target.set_cache_link(Some(CacheLink { pool, index }));
    }

    /// Parks `allocation` for reuse once `fence` retires on `engine`.
    pub fn store_for_reuse(&self, allocation: Arc<Allocation>, engine: EngineId, fence: FenceValue) {
        if fence != FENCE_NEVER_USED {
            allocation.stamp_fence(engine, fence);
        }
        self.push(CachePool::Reusable, allocation);
    }

    /// Parks `allocation` until its fences retire.
    pub fn store_temporary(&self, allocation: Arc<Allocation>) {
        self.push(CachePool::Temporary, allocation);
    }

    /// Unlinks `allocation` from whichever pool holds it.
    ///
    /// # Returns
    ///
    /// True if it was parked.
    pub fn detach(&self, allocation: &Allocation) -> bool {
        let Some(link) = allocation.cache_link() else {
            return false;
        };
        let mut list = self.pool(link.pool).lock();
        // Re-read under the pool lock: a concurrent reclaim may have won.
        if allocation.cache_link() != Some(link) {
            return false;
        }
        allocation.set_cache_link(None);
        list.remove(link.index).is_some()
    }

    /// Removes every temporary entry whose uses have retired.
    ///
    /// An entry qualifies when its fence on `engine` is at most `retired`
    /// and it is idle on every other engine according to `fences`.
    ///
    /// # Returns
    ///
    /// The removed allocations. The caller frees them outside the lock.
    pub fn reclaim(
        &self,
        engine: EngineId,
        retired: FenceValue,
        fences: &FenceTracker,
    ) -> Vec<Arc<Allocation>> {
        let mut list = self.temporary.lock();
        let reclaimed = list.remove_matching(|allocation| {
            fences.engines().all(|e| {
                let fence = allocation.last_fence(e);
                if e == engine {
                    fence == FENCE_NEVER_USED || fence <= retired
                } else {
                    fences.is_fence_retired(e, fence)
                }
            })
        });
        for allocation in &reclaimed {
            allocation.set_cache_link(None);
        }
        reclaimed
    }

    /// Removes and returns the first reusable allocation satisfying the
    /// request.
    ///
    /// # Arguments
    ///
    /// * `size` - Minimum capacity in bytes
    /// * `want_32bit` - Required bitness
    /// * `fences` - Retirement source; only idle allocations qualify
    pub fn detach_best_fit(
        &self,
        size: u64,
        want_32bit: bool,
        fences: &FenceTracker,
    ) -> Option<Arc<Allocation>> {
        let mut list = self.reusable.lock();
        let allocation = list.remove_first(|candidate| {
            candidate.is_32bit() == want_32bit
                && candidate.aligned_size() >= size
                && fences.is_idle(candidate)
        })?;
        allocation.set_cache_link(None);
        Some(allocation)
    }

    /// Empties both pools, for teardown.
    pub fn take_all(&self) -> Vec<Arc<Allocation>> {
        let mut all = self.reusable.lock().take_all();
        all.extend(self.temporary.lock().take_all());
        for allocation in &all {
            allocation.set_cache_link(None);
        }
        all
    }

    /// Entries in the reusable pool.
    #[must_use]
    pub fn reusable_len(&self) -> usize {
        self.reusable.lock().len()
    }

    /// Entries in the temporary pool.
    #[must_use]
    pub fn temporary_len(&self) -> usize {
        self.temporary.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backing;
    use crate::memory::AllocationId;
    use crate::sync::WaitPolicy;
    use gfxmem_shared::AllocationKind;

    fn allocation(id: u64, size: u64, is_32bit: bool) -> Arc<Allocation> {
        let backing = Backing { handle: id, gpu_address: id << 20, size };
        Arc::new(Allocation::new(AllocationId(id), size, AllocationKind::Buffer, backing, is_32bit, 1))
    }

    #[test]
    fn test_store_reclaim_detach_round_trip() {
        let fences = FenceTracker::new(1, WaitPolicy::default());
        let e = EngineId(0);
        let cache = AllocationCache::new();
        let a = allocation(1, 8192, false);

        cache.store_for_reuse(Arc::clone(&a), e, 3);
        assert_eq!(a.cache_pool(), Some(CachePool::Reusable));
        assert!(cache.detach_best_fit(4096, false, &fences).is_none(), "fence 3 not retired");

        fences.tag(e).signal(3);
        assert!(cache.reclaim(e, 3, &fences).is_empty());
        let found = cache.detach_best_fit(4096, false, &fences).unwrap();

        assert_eq!(found.id(), a.id());
        assert!(found.aligned_size() >= 4096);
        assert!(fences.is_retired(&found, e));
        assert_eq!(found.cache_pool(), None);
        assert_eq!(cache.reusable_len(), 0);
    }

    #[test]
    fn test_first_fit_not_tightest() {
        let fences = FenceTracker::new(1, WaitPolicy::default());
        let cache = AllocationCache::new();
        cache.store_for_reuse(allocation(1, 4096, false), EngineId(0), FENCE_NEVER_USED);
        cache.store_for_reuse(allocation(2, 65536, false), EngineId(0), FENCE_NEVER_USED);
        cache.store_for_reuse(allocation(3, 8192, false), EngineId(0), FENCE_NEVER_USED);

        let found = cache.detach_best_fit(8192, false, &fences).unwrap();
        assert_eq!(found.id(), AllocationId(2));
    }

    #[test]
    fn test_bitness_must_match() {
        let fences = FenceTracker::new(1, WaitPolicy::default());
        let cache = AllocationCache::new();
        cache.store_for_reuse(allocation(1, 4096, true), EngineId(0), FENCE_NEVER_USED);

        assert!(cache.detach_best_fit(4096, false, &fences).is_none());
        assert!(cache.detach_best_fit(4096, true, &fences).is_some());
    }

    #[test]
    fn test_reclaim_keeps_unretired() {
        let fences = FenceTracker::new(1, WaitPolicy::default());
        let e = EngineId(0);
        let cache = AllocationCache::new();
        let done = allocation(1, 4096, false);
        let busy = allocation(2, 4096, false);
        let unused = allocation(3, 4096, false);
        done.stamp_fence(e, 1);
        busy.stamp_fence(e, 5);

        cache.store_temporary(Arc::clone(&done));
        cache.store_temporary(Arc::clone(&busy));
        cache.store_temporary(Arc::clone(&unused));

        let reclaimed: Vec<_> = cache.reclaim(e, 2, &fences).iter().map(|a| a.id()).collect();
        assert_eq!(reclaimed, vec![AllocationId(1), AllocationId(3)]);
        assert_eq!(cache.temporary_len(), 1);
        assert_eq!(busy.cache_pool(), Some(CachePool::Temporary));
    }

    #[test]
    fn test_pool_membership_is_exclusive() {
        let cache = AllocationCache::new();
        let a = allocation(1, 4096, false);

        cache.store_temporary(Arc::clone(&a));
        cache.store_for_reuse(Arc::clone(&a), EngineId(0), FENCE_NEVER_USED);

        assert_eq!(cache.temporary_len(), 0);
        assert_eq!(cache.reusable_len(), 1);
        assert!(cache.detach(&a));
        assert!(!cache.detach(&a));
    }

    #[test]
    fn test_concurrent_store_and_reclaim() {
        let fences = Arc::new(FenceTracker::new(1, WaitPolicy::default()));
        let cache = Arc::new(AllocationCache::new());
        let e = EngineId(0);

        let producers: Vec<_> = (0..4u64)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        cache.store_temporary(allocation(t * 1000 + i, 4096, false));
                    }
                })
            })
            .collect();

        let mut reclaimed = 0;
        while producers.iter().any(|p| !p.is_finished()) {
            reclaimed += cache.reclaim(e, fences.retired_fence(e), &fences).len();
        }
        for producer in producers {
            producer.join().unwrap();
        }
        reclaimed += cache.reclaim(e, fences.retired_fence(e), &fences).len();

        assert_eq!(reclaimed, 1000);
        assert_eq!(cache.temporary_len(), 0);
    }
}
