//! # Residency Set & Evictor
//!
//! Tracks what one engine has mapped and keeps it inside the platform
//! budget.
//!
//! ## Allocation States
//!
//! ```text
//!   NotResident ──make_resident──> Resident ──record_submission──> TrimCandidate
//!        ▲                                                              │
//!        └──────────────── trim / periodic trim / forget ───────────────┘
//! ```
//!
//! ## Eviction Rules
//!
//! A candidate is evictable when its last fence on this engine is at most
//! the last submitted fence. If it has not retired yet, the evictor waits
//! for exactly that fence with the set's lock released, then revalidates
//! the candidate before evicting it. Work the device may still touch is
//! never unmapped.
//!
//! ## Budget Accounting
//!
//! `used_bytes` counts page-aligned sizes. Fragments shared between mapped
//! allocations are counted once: a fragment is mapped on the first
//! allocation that needs it and unmapped when the last one goes.

use super::trim_list::TrimCandidateList;
use crate::backend::{AllocationBackend, BackendError, Backing};
use crate::error::{DriverError, DriverResult};
use crate::memory::{Allocation, AllocationId};
use crate::sync::FenceTracker;
use gfxmem_shared::{EngineId, FenceValue, FENCE_NEVER_USED};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Counters kept by a residency set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResidencyStats {
    /// Allocations evicted.
    pub evictions: u64,
    /// Bytes unmapped by evictions.
    pub bytes_evicted: u64,
    /// Residency requests that had to ignore the budget.
    pub forced: u64,
    /// Trim passes that waited for a fence.
    pub fence_waits: u64,
}

#[derive(Debug)]
struct ResidencyState {
    trim_list: TrimCandidateList,
    mapped: HashMap<AllocationId, Arc<Allocation>>,
    used_bytes: u64,
    last_periodic_fence: FenceValue,
    budget_exhausted: bool,
    stats: ResidencyStats,
}

/// The resident working set of one engine.
///
/// # Thread Safety
///
/// All residency flags and trim positions of this engine are written
/// under the internal mutex. The mutex is released around every fence
/// wait.
#[derive(Debug)]
pub struct ResidencySet {
    engine: EngineId,
    backend: Arc<dyn AllocationBackend>,
    fences: Arc<FenceTracker>,
    state: Mutex<ResidencyState>,
}

impl ResidencySet {
    /// Creates an empty set for `engine`.
    #[must_use]
    pub fn new(engine: EngineId, backend: Arc<dyn AllocationBackend>, fences: Arc<FenceTracker>) -> Self {
        Self {
            engine,
            backend,
            fences,
            state: Mutex::new(ResidencyState {
                trim_list: TrimCandidateList::new(engine),
                mapped: HashMap::new(),
                used_bytes: 0,
                last_periodic_fence: 0,
                budget_exhausted: false,
                stats: ResidencyStats::default(),
            }),
        }
    }

    /// Engine served by this set.
    #[must_use]
    pub const fn engine(&self) -> EngineId {
        self.engine
    }

    /// Maps every allocation in `allocations` that is not resident yet.
    ///
    /// On an over-budget report the set trims by the reported overrun and
    /// retries; a second failure retries with the budget ignored.
    /// Allocations in `allocations` are never trimmed to make room for
    /// themselves.
    ///
    /// # Errors
    ///
    /// `BudgetExhausted` if even the forced mapping fails; wait errors
    /// from trimming; other backend failures.
    pub fn make_resident(&self, allocations: &[Arc<Allocation>]) -> DriverResult<()> {
        let mut guard = self.state.lock();

        let mut seen = HashSet::new();
        let mut pending: Vec<&Arc<Allocation>> = allocations
            .iter()
            .filter(|a| !a.is_resident(self.engine) && seen.insert(a.id()))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut units = self.plan_units(&pending);
        let mut result = self.backend.make_resident(&units, false);

        if let Err(BackendError::OverBudget { bytes }) = result {
            tracing::debug!("{}: {} bytes over budget, trimming", self.engine, bytes);
            let protected: HashSet<AllocationId> = allocations.iter().map(|a| a.id()).collect();
            self.evict_matching(&mut guard, Some(bytes), &protected, |_, _| true)?;

            // Trimming may have waited unlocked while another caller mapped
            // part of the request.
            pending.retain(|a| !a.is_resident(self.engine));
            if pending.is_empty() {
                guard.budget_exhausted = false;
                return Ok(());
            }
            units = self.plan_units(&pending);
            result = self.backend.make_resident(&units, false);
            if let Err(BackendError::OverBudget { bytes }) = result {
                tracing::warn!("{}: still {} bytes over budget, forcing residency", self.engine, bytes);
                guard.stats.forced += 1;
                result = self.backend.make_resident(&units, true);
            }
        }

        match result {
            Ok(()) => {
                for allocation in pending {
                    Self::commit(&mut guard, self.engine, allocation);
                }
                guard.budget_exhausted = false;
                Ok(())
            }
            Err(BackendError::OverBudget { bytes }) => {
                tracing::error!("{}: residency budget exhausted ({} bytes over)", self.engine, bytes);
                guard.budget_exhausted = true;
                Err(DriverError::BudgetExhausted { bytes_over: bytes })
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Backings that must be newly mapped for `pending`.
    fn plan_units(&self, pending: &[&Arc<Allocation>]) -> Vec<Backing> {
        let mut handles = HashSet::new();
        let mut units = Vec::new();
        for allocation in pending {
            if let Some(backing) = allocation.backing() {
                units.push(backing);
            }
            for fragment in allocation.fragments() {
                if fragment.residency_count(self.engine) == 0 && handles.insert(fragment.backing().handle) {
                    units.push(fragment.backing());
                }
            }
        }
        units
    }

    fn commit(state: &mut ResidencyState, engine: EngineId, allocation: &Arc<Allocation>) {
        let mut bytes = allocation.backing().map_or(0, |b| b.size);
        for fragment in allocation.fragments() {
            if fragment.acquire_residency(engine) {
                bytes += fragment.size();
            }
        }
        allocation.set_resident(engine, true);
        state.mapped.insert(allocation.id(), Arc::clone(allocation));
        state.used_bytes += bytes;
    }

    /// Makes resident allocations of a recorded submission evictable.
    pub fn record_submission(&self, allocations: &[Arc<Allocation>]) {
        let mut state = self.state.lock();
        for allocation in allocations {
            if allocation.is_resident(self.engine) {
                state.trim_list.add(allocation);
            }
        }
    }

    /// Evicts candidates from the head of the ordering until `bytes` are
    /// freed.
    ///
    /// # Returns
    ///
    /// Whether the full target was met. `trim_to_budget(0)` evicts nothing
    /// and returns true.
    ///
    /// # Errors
    ///
    /// `DeviceLost` or `Timeout` from a fence wait.
    pub fn trim_to_budget(&self, bytes: u64) -> DriverResult<bool> {
        if bytes == 0 {
            return Ok(true);
        }
        let mut guard = self.state.lock();
        let freed = self.evict_matching(&mut guard, Some(bytes), &HashSet::new(), |_, _| true)?;
        tracing::debug!("{}: trimmed {} of {} bytes", self.engine, freed, bytes);
        Ok(freed >= bytes)
    }

    /// Evicts every candidate unused since the previous periodic trim.
    ///
    /// # Returns
    ///
    /// Bytes freed.
    ///
    /// # Errors
    ///
    /// `DeviceLost` or `Timeout` from a fence wait.
    pub fn periodic_trim(&self) -> DriverResult<u64> {
        let mut guard = self.state.lock();
        let threshold = guard.last_periodic_fence;
        let freed = self.evict_matching(&mut guard, None, &HashSet::new(), |_, fence| {
            fence == FENCE_NEVER_USED || fence <= threshold
        })?;
        guard.last_periodic_fence = self.fences.current_fence(self.engine);
        if freed > 0 {
            tracing::debug!("{}: periodic trim freed {} bytes", self.engine, freed);
        }
        Ok(freed)
    }

    /// Restarts the periodic window at the current fence without evicting.
    pub fn restart_periodic_trim(&self) {
        self.state.lock().last_periodic_fence = self.fences.current_fence(self.engine);
    }

    /// Walks the ordering from its head, evicting candidates that are
    /// submitted, not protected, and accepted by `eligible`.
    ///
    /// Stops once `target` bytes are freed, if a target is given.
    fn evict_matching(
        &self,
        guard: &mut MutexGuard<'_, ResidencyState>,
        target: Option<u64>,
        protected: &HashSet<AllocationId>,
        eligible: impl Fn(&Allocation, FenceValue) -> bool,
    ) -> DriverResult<u64> {
        if guard.trim_list.should_compact() {
            guard.trim_list.compact();
        }

        let mut freed = 0u64;
        let mut index = 0usize;
        while index < guard.trim_list.len() && target.map_or(true, |t| freed < t) {
            let Some(candidate) = guard.trim_list.get(index).cloned() else {
                index += 1;
                continue;
            };
            let fence = candidate.last_fence(self.engine);
            let submitted = fence == FENCE_NEVER_USED || fence <= self.fences.last_submitted_fence(self.engine);
            if protected.contains(&candidate.id()) || !submitted || !eligible(&candidate, fence) {
                index += 1;
                continue;
            }

            if !self.fences.is_fence_retired(self.engine, fence) {
                guard.stats.fence_waits += 1;
                MutexGuard::unlocked(guard, || self.fences.wait(self.engine, fence))?;
                // The list may have been trimmed, compacted or resubmitted
                // into meanwhile; rescan from the head.
                index = 0;
                continue;
            }

            freed += self.evict_locked(guard, &candidate);
            index += 1;
        }
        Ok(freed)
    }

    /// Unmaps `allocation` and drops it from the ordering.
    ///
    /// Returns the bytes that left the budget.
    fn evict_locked(&self, state: &mut ResidencyState, allocation: &Allocation) -> u64 {
        state.trim_list.remove(allocation);
        if !allocation.is_resident(self.engine) {
            return 0;
        }

        let mut units = Vec::with_capacity(1 + allocation.fragments().len());
        let mut bytes = 0;
        if let Some(backing) = allocation.backing() {
            units.push(backing);
            bytes += backing.size;
        }
        for fragment in allocation.fragments() {
            if fragment.release_residency(self.engine) {
                units.push(fragment.backing());
                bytes += fragment.size();
            }
        }

        self.backend.evict(&units);
        allocation.set_resident(self.engine, false);
        state.mapped.remove(&allocation.id());
        state.used_bytes -= bytes;
        state.stats.evictions += 1;
        state.stats.bytes_evicted += bytes;
        bytes
    }

    /// Drops `allocation` from the set before it is freed.
    pub fn forget(&self, allocation: &Allocation) {
        let mut state = self.state.lock();
        self.evict_locked(&mut state, allocation);
    }

    /// Bytes currently counted against the budget.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }

    /// Recomputes mapped bytes from the mapped allocations.
    ///
    /// Always equal to [`used_bytes`](Self::used_bytes).
    #[must_use]
    pub fn mapped_bytes(&self) -> u64 {
        let state = self.state.lock();
        let mut fragments = HashSet::new();
        let mut bytes = 0;
        for allocation in state.mapped.values() {
            bytes += allocation.backing().map_or(0, |b| b.size);
            for fragment in allocation.fragments() {
                if fragments.insert(fragment.backing().handle) {
                    bytes += fragment.size();
                }
            }
        }
        bytes
    }

    /// True if `id` is mapped in this set.
    #[must_use]
    pub fn contains(&self, id: AllocationId) -> bool {
        self.state.lock().mapped.contains_key(&id)
    }

    /// Number of mapped allocations.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.state.lock().mapped.len()
    }

    /// Live trim candidates.
    #[must_use]
    pub fn trim_candidate_count(&self) -> usize {
        self.state.lock().trim_list.live_count()
    }

    /// True after a residency request failed even when forced.
    #[must_use]
    pub fn is_budget_exhausted(&self) -> bool {
        self.state.lock().budget_exhausted
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> ResidencyStats {
        self.state.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::memory::{FragmentAcquire, FragmentRange, FragmentRegistry};
    use crate::sync::WaitPolicy;
    use gfxmem_shared::{AllocationKind, PAGE_SIZE};
    use std::time::Duration;

    const E: EngineId = EngineId(0);
    const UNIT: u64 = 16 * PAGE_SIZE;

    struct Fixture {
        backend: Arc<HostBackend>,
        fences: Arc<FenceTracker>,
        set: ResidencySet,
        next_id: u64,
    }

    impl Fixture {
        fn new(budget: u64) -> Self {
            let backend = Arc::new(HostBackend::new(1 << 30, budget));
            let policy = WaitPolicy::default().with_timeout(Some(Duration::from_millis(50)));
            let fences = Arc::new(FenceTracker::new(1, policy));
            let dyn_backend: Arc<dyn AllocationBackend> = backend.clone();
            let set = ResidencySet::new(E, dyn_backend, Arc::clone(&fences));
            Self { backend, fences, set, next_id: 0 }
        }

        fn allocate(&mut self, size: u64) -> Arc<Allocation> {
            self.next_id += 1;
            let backing = self.backend.reserve(size, PAGE_SIZE).unwrap();
            Arc::new(Allocation::new(AllocationId(self.next_id), size, AllocationKind::Buffer, backing, false, 1))
        }

        /// Makes `allocation` resident and records it as used by `fence`.
        fn submit(&self, allocation: &Arc<Allocation>, fence: FenceValue) {
            self.set.make_resident(std::slice::from_ref(allocation)).unwrap();
            self.fences.stamp_future(allocation, E, fence);
            self.set.record_submission(std::slice::from_ref(allocation));
            self.fences.mark_submitted(E, fence);
        }
    }

    #[test]
    fn test_trim_zero_is_noop() {
        let mut fx = Fixture::new(4 * UNIT);
        let a = fx.allocate(UNIT);
        fx.submit(&a, 1);

        assert!(fx.set.trim_to_budget(0).unwrap());
        assert!(a.is_resident(E));
        assert_eq!(fx.set.stats().evictions, 0);
    }

    #[test]
    fn test_trim_evicts_oldest_retired_first() {
        let mut fx = Fixture::new(3 * UNIT);
        let allocs: Vec<_> = (0..3).map(|_| fx.allocate(UNIT)).collect();
        for (fence, allocation) in allocs.iter().enumerate() {
            fx.submit(allocation, fence as FenceValue);
        }
        fx.fences.tag(E).signal(1);

        assert!(fx.set.trim_to_budget(UNIT).unwrap());

        assert!(!allocs[0].is_resident(E));
        assert!(allocs[1].is_resident(E));
        assert!(allocs[2].is_resident(E));
        assert_eq!(fx.set.used_bytes(), 2 * UNIT);
        assert_eq!(fx.set.used_bytes(), fx.set.mapped_bytes());
    }

    #[test]
    fn test_trim_skips_unsubmitted_candidates() {
        let mut fx = Fixture::new(4 * UNIT);
        let a = fx.allocate(UNIT);
        fx.set.make_resident(std::slice::from_ref(&a)).unwrap();
        fx.fences.stamp_future(&a, E, 5);
        fx.set.record_submission(std::slice::from_ref(&a));
        fx.fences.mark_submitted(E, 4);

        assert!(!fx.set.trim_to_budget(UNIT).unwrap());
        assert!(a.is_resident(E));
    }

    #[test]
    fn test_trim_waits_for_submitted_fence() {
        let mut fx = Fixture::new(4 * UNIT);
        let a = fx.allocate(UNIT);
        fx.submit(&a, 3);

        let tag = fx.fences.tag(E);
        let retirer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            tag.signal(3);
        });

        assert!(fx.set.trim_to_budget(UNIT).unwrap());
        retirer.join().unwrap();
        assert!(!a.is_resident(E));
        assert!(fx.fences.retired_fence(E) >= 3);
        assert_eq!(fx.set.stats().fence_waits, 1);
    }

    #[test]
    fn test_trim_propagates_timeout() {
        let mut fx = Fixture::new(4 * UNIT);
        let a = fx.allocate(UNIT);
        fx.submit(&a, 3);

        let err = fx.set.trim_to_budget(UNIT).unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));
        assert!(a.is_resident(E));
        assert_eq!(fx.set.trim_candidate_count(), 1);
    }

    #[test]
    fn test_over_budget_trims_then_maps() {
        let mut fx = Fixture::new(2 * UNIT);
        let a = fx.allocate(UNIT);
        let b = fx.allocate(UNIT);
        let c = fx.allocate(UNIT);
        fx.submit(&a, 1);
        fx.submit(&b, 2);
        fx.fences.tag(E).signal(2);

        fx.set.make_resident(std::slice::from_ref(&c)).unwrap();

        assert!(!a.is_resident(E));
        assert!(b.is_resident(E));
        assert!(c.is_resident(E));
        assert_eq!(fx.backend.resident_bytes(), 2 * UNIT);
        assert!(!fx.set.is_budget_exhausted());
    }

    #[test]
    fn test_trim_one_unit_of_three_with_fence_one_retired() {
        let mut fx = Fixture::new(2 * UNIT);
        let allocs: Vec<_> = (0..3).map(|_| fx.allocate(UNIT)).collect();

        // One request: none of the three may be trimmed for it, so the
        // third unit is admitted over budget.
        fx.set.make_resident(&allocs).unwrap();
        assert_eq!(fx.set.stats().forced, 1);
        for (fence, allocation) in allocs.iter().enumerate() {
            fx.fences.stamp_future(allocation, E, fence as FenceValue);
        }
        fx.set.record_submission(&allocs);
        fx.fences.mark_submitted(E, 2);
        fx.fences.tag(E).signal(1);

        assert!(fx.set.trim_to_budget(UNIT).unwrap());

        assert!(!allocs[0].is_resident(E));
        assert!(allocs[1].is_resident(E), "target met before the fence-1 candidate");
        assert!(allocs[2].is_resident(E));
        assert_eq!(fx.set.stats().evictions, 1);
        assert_eq!(fx.set.stats().fence_waits, 0);
        assert_eq!(fx.set.used_bytes(), 2 * UNIT);
        assert_eq!(fx.set.used_bytes(), fx.set.mapped_bytes());
        assert_eq!(fx.backend.resident_bytes(), 2 * UNIT);
    }

    #[test]
    fn test_concurrent_requests_map_shared_allocation_once() {
        let mut fx = Fixture::new(UNIT);
        let old = fx.allocate(UNIT);
        let shared = fx.allocate(UNIT);
        fx.submit(&old, 1);

        // Both callers find the budget full and wait on fence 1 unlocked.
        let tag = fx.fences.tag(E);
        std::thread::scope(|scope| {
            let callers: Vec<_> = (0..2)
                .map(|_| scope.spawn(|| fx.set.make_resident(std::slice::from_ref(&shared))))
                .collect();
            std::thread::sleep(Duration::from_millis(10));
            tag.signal(1);
            for caller in callers {
                caller.join().unwrap().unwrap();
            }
        });

        assert!(!old.is_resident(E));
        assert!(shared.is_resident(E));
        assert_eq!(fx.set.resident_count(), 1);
        assert_eq!(fx.set.used_bytes(), UNIT);
        assert_eq!(fx.set.used_bytes(), fx.set.mapped_bytes());
        assert_eq!(fx.backend.resident_bytes(), UNIT);

        // A single eviction fully unmaps it.
        fx.set.forget(&shared);
        assert!(!fx.backend.is_resident(&shared.backing().unwrap()));
    }

    #[test]
    fn test_trim_rescans_compacted_list_after_wait() {
        let mut fx = Fixture::new(8 * UNIT);
        let allocs: Vec<_> = (0..6).map(|_| fx.allocate(UNIT)).collect();
        for allocation in &allocs {
            fx.submit(allocation, 1);
        }
        let tail = fx.allocate(UNIT);
        fx.submit(&tail, 2);

        // Tombstones at the head so a concurrent trim compacts the list.
        for allocation in &allocs[..4] {
            fx.set.forget(allocation);
        }

        let tag = fx.fences.tag(E);
        std::thread::scope(|scope| {
            let trimmer = scope.spawn(|| fx.set.trim_to_budget(3 * UNIT));
            std::thread::sleep(Duration::from_millis(10));
            tag.signal(2);
            assert!(trimmer.join().unwrap().unwrap());
        });

        assert!(allocs.iter().chain(std::iter::once(&tail)).all(|a| !a.is_resident(E)));
        assert_eq!(fx.set.used_bytes(), 0);
        assert_eq!(fx.set.trim_candidate_count(), 0);
    }

    #[test]
    fn test_over_budget_forces_when_nothing_trimmable() {
        let mut fx = Fixture::new(UNIT);
        let a = fx.allocate(UNIT);
        let b = fx.allocate(UNIT);

        fx.set.make_resident(&[Arc::clone(&a), Arc::clone(&b)]).unwrap();

        assert!(a.is_resident(E) && b.is_resident(E));
        assert_eq!(fx.set.stats().forced, 1);
        assert_eq!(fx.set.used_bytes(), 2 * UNIT);
    }

    #[test]
    fn test_periodic_trim_evicts_unused_since_last_call() {
        let mut fx = Fixture::new(4 * UNIT);
        let old = fx.allocate(UNIT);
        fx.fences.next_fence(E);
        fx.submit(&old, 1);
        fx.fences.tag(E).signal(1);

        assert_eq!(fx.set.periodic_trim().unwrap(), 0, "window starts at fence 0");

        let young = fx.allocate(UNIT);
        fx.fences.next_fence(E);
        fx.submit(&young, 2);
        fx.fences.tag(E).signal(2);

        assert_eq!(fx.set.periodic_trim().unwrap(), UNIT);
        assert!(!old.is_resident(E));
        assert!(young.is_resident(E));
    }

    #[test]
    fn test_restart_periodic_trim_does_not_evict() {
        let mut fx = Fixture::new(4 * UNIT);
        let a = fx.allocate(UNIT);
        fx.fences.next_fence(E);
        fx.submit(&a, 1);
        fx.fences.tag(E).signal(1);

        fx.set.restart_periodic_trim();
        assert!(a.is_resident(E));
        assert_eq!(fx.set.periodic_trim().unwrap(), UNIT);
    }

    #[test]
    fn test_forget_unmaps_and_unlinks() {
        let mut fx = Fixture::new(4 * UNIT);
        let a = fx.allocate(UNIT);
        fx.submit(&a, 1);

        fx.set.forget(&a);
        assert!(!a.is_resident(E));
        assert_eq!(a.trim_position(E), None);
        assert_eq!(fx.set.used_bytes(), 0);
        assert_eq!(fx.backend.resident_bytes(), 0);
    }

    #[test]
    fn test_shared_fragment_counted_once() {
        let fx = Fixture::new(1 << 24);
        let registry = FragmentRegistry::new(1);
        let range = FragmentRange { address: 0x4000, size: 0x2000 };
        let take = || match registry.try_acquire(&[range], fx.backend.as_ref()).unwrap() {
            FragmentAcquire::Acquired { fragments, .. } => fragments,
            FragmentAcquire::Conflict(_) => panic!("unexpected conflict"),
        };
        let a = Arc::new(Allocation::imported(AllocationId(1), 0x4000, 0x2000, take(), 1));
        let b = Arc::new(Allocation::imported(AllocationId(2), 0x4000, 0x1000, take(), 1));

        fx.set.make_resident(&[Arc::clone(&a), Arc::clone(&b)]).unwrap();
        assert_eq!(fx.set.used_bytes(), 0x2000);
        assert_eq!(fx.set.used_bytes(), fx.set.mapped_bytes());

        fx.set.forget(&a);
        assert_eq!(fx.set.used_bytes(), 0x2000, "b still maps the fragment");
        assert!(fx.backend.is_resident(&b.fragments()[0].backing()));

        fx.set.forget(&b);
        assert_eq!(fx.set.used_bytes(), 0);
    }
}
