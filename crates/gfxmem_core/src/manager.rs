//! # Memory Manager
//!
//! The upward API of the core. Ties the allocation cache, fragment
//! registry, residency sets, fence tracker and deferred deleter together.
//!
//! ## Allocation Flow
//!
//! ```text
//!   acquire(size, kind)
//!     │
//!     ├─> reusable pool hit?  ──yes──> reuse
//!     │
//!     ├─> backend.reserve()   ──ok───> fresh allocation
//!     │         │
//!     │       OOM ──> drain deleter (blocking) + reclaim ──> retry once
//!     │
//!     └─> OutOfMemory
//!
//!   release(alloc)
//!     ├─ idle on every engine ─────> free now
//!     ├─ deferred deleter enabled ─> queue deletion
//!     └─ otherwise ────────────────> temporary pool
//! ```
//!
//! ## Thread Safety
//!
//! `MemoryManager` is `Sync`; every operation may be called from any
//! thread. Fence waits never happen under a pool or residency lock.

use crate::backend::{AllocationBackend, HostBackend};
use crate::config::MemoryConfig;
use crate::device::{Device, SimulatedDevice, Submission};
use crate::error::{DriverError, DriverResult};
use crate::memory::{
    split_host_range, Allocation, AllocationCache, AllocationId, FragmentAcquire, FragmentRegistry, Heap32,
};
use crate::residency::ResidencySet;
use crate::stats::MemoryStats;
use crate::sync::{DeferrableDeletion, DeferredDeleter, DeletionOutcome, FenceTracker};
use gfxmem_shared::{AllocationKind, EngineId, FenceValue, PAGE_SIZE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// State shared with deferred deletions.
#[derive(Debug)]
struct ManagerCore {
    config: MemoryConfig,
    backend: Arc<dyn AllocationBackend>,
    fences: Arc<FenceTracker>,
    fragments: FragmentRegistry,
    residency: Box<[ResidencySet]>,
    cache: AllocationCache,
    heap32: OnceLock<Heap32>,
    stats: Mutex<MemoryStats>,
}

impl ManagerCore {
    /// Returns every resource of `allocation` to the backend.
    ///
    /// The device must be done with it.
    fn free_now(&self, allocation: &Allocation) {
        for set in self.residency.iter() {
            set.forget(allocation);
        }

        if let Some(backing) = allocation.backing() {
            self.backend.release(backing);
            if allocation.is_32bit() {
                if let Some(heap) = self.heap32.get() {
                    heap.free(allocation.gpu_address(), allocation.aligned_size());
                }
            }
        }
        for fragment in allocation.fragments() {
            if let Some(backing) = self.fragments.release(fragment) {
                self.backend.release(backing);
            }
        }

        self.stats.lock().frees += 1;
    }

    /// Frees temporary allocations retired on `engine`.
    fn reclaim(&self, engine: EngineId) -> usize {
        let retired = self.fences.retired_fence(engine);
        let reclaimed = self.cache.reclaim(engine, retired, &self.fences);
        for allocation in &reclaimed {
            self.free_now(allocation);
        }
        reclaimed.len()
    }

    fn reclaim_all(&self) -> usize {
        self.fences.engines().map(|engine| self.reclaim(engine)).sum()
    }
}

/// Deletion of an allocation released while in flight.
struct AllocationDeletion {
    core: Arc<ManagerCore>,
    allocation: Arc<Allocation>,
}

impl DeferrableDeletion for AllocationDeletion {
    fn apply(&mut self) -> DeletionOutcome {
        if self.core.fences.is_idle(&self.allocation) {
            self.core.free_now(&self.allocation);
            return DeletionOutcome::Freed;
        }
        if let Some(engine) = self.core.fences.lost_engine() {
            // Nothing on a lost device can touch the memory anymore.
            self.core.free_now(&self.allocation);
            return DeletionOutcome::DeviceLost(engine);
        }
        DeletionOutcome::Pending
    }
}

/// Resource-lifecycle core of one device.
#[derive(Debug)]
pub struct MemoryManager {
    core: Arc<ManagerCore>,
    device: Arc<dyn Device>,
    deleter: DeferredDeleter,
    deleter_enabled: AtomicBool,
    next_id: AtomicU64,
}

impl MemoryManager {
    /// Creates a manager over `backend` and `device`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the config is invalid or its engine count differs
    /// from the device's; `Backend` if the deleter cannot start.
    pub fn new(
        config: MemoryConfig,
        backend: Arc<dyn AllocationBackend>,
        device: Arc<dyn Device>,
    ) -> DriverResult<Self> {
        config.validate()?;
        let fences = device.fences();
        if fences.engine_count() != config.engine_count {
            return Err(DriverError::InvalidConfig(format!(
                "device exposes {} engines, config expects {}",
                fences.engine_count(),
                config.engine_count
            )));
        }

        let residency = fences
            .engines()
            .map(|engine| ResidencySet::new(engine, Arc::clone(&backend), Arc::clone(&fences)))
            .collect();

        let deleter = DeferredDeleter::new(config.wait.poll_interval());
        if config.enable_deferred_deleter {
            deleter.add_client()?;
        }
        let deleter_enabled = AtomicBool::new(config.enable_deferred_deleter);

        tracing::info!(
            "memory manager ready: {} engines, budget {} bytes, reuse {}, deferred deletion {}",
            config.engine_count,
            config.residency.budget_bytes,
            config.enable_allocation_reuse,
            config.enable_deferred_deleter
        );

        Ok(Self {
            core: Arc::new(ManagerCore {
                fragments: FragmentRegistry::new(config.engine_count),
                config,
                backend,
                fences,
                residency,
                cache: AllocationCache::new(),
                heap32: OnceLock::new(),
                stats: Mutex::new(MemoryStats::default()),
            }),
            device,
            deleter,
            deleter_enabled,
            next_id: AtomicU64::new(1),
        })
    }

    /// Creates a manager over a [`HostBackend`] and a manual
    /// [`SimulatedDevice`], both sized from `config`.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn simulated(config: MemoryConfig) -> DriverResult<(Self, Arc<SimulatedDevice>, Arc<HostBackend>)> {
        config.validate()?;
        let fences = Arc::new(FenceTracker::new(
            config.engine_count,
            crate::sync::WaitPolicy::from_config(&config.wait),
        ));
        let device = Arc::new(SimulatedDevice::manual(fences));
        let backend = Arc::new(HostBackend::new(config.device_memory_bytes, config.residency.budget_bytes));
        let manager = Self::new(config, backend.clone(), device.clone())?;
        Ok((manager, device, backend))
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.core.config
    }

    /// Fence tracker shared with the device.
    #[must_use]
    pub fn fences(&self) -> &Arc<FenceTracker> {
        &self.core.fences
    }

    /// Temporary and reusable pools.
    #[must_use]
    pub fn cache(&self) -> &AllocationCache {
        &self.core.cache
    }

    /// Host-import fragment registry.
    #[must_use]
    pub fn fragments(&self) -> &FragmentRegistry {
        &self.core.fragments
    }

    /// Deferred deleter.
    #[must_use]
    pub fn deleter(&self) -> &DeferredDeleter {
        &self.deleter
    }

    /// The 32-bit heap, if anything needed it yet.
    #[must_use]
    pub fn heap32(&self) -> Option<&Heap32> {
        self.core.heap32.get()
    }

    /// Residency set of `engine`.
    ///
    /// # Errors
    ///
    /// `UnknownEngine` for an engine the device does not expose.
    pub fn residency(&self, engine: EngineId) -> DriverResult<&ResidencySet> {
        self.core.fences.check_engine(engine)?;
        Ok(&self.core.residency[engine.index()])
    }

    fn next_id(&self) -> AllocationId {
        AllocationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns an allocation of at least `size` bytes.
    ///
    /// Reusable allocations are preferred. A fresh one is reserved on a
    /// miss; if the backend is exhausted, deferred deletions are drained
    /// synchronously and the reservation is retried once.
    ///
    /// The result is not resident.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` after the retry; `InvalidRequest` for a zero size or
    /// an alignment that is not a power of two; `DeviceLost` surfaced by
    /// the drain.
    pub fn acquire(&self, size: u64, kind: AllocationKind, alignment: u64) -> DriverResult<Arc<Allocation>> {
        if size == 0 || !alignment.is_power_of_two() {
            return Err(DriverError::InvalidRequest(format!(
                "size {size} / alignment {alignment} not allocatable"
            )));
        }
        let want_32bit = kind.requires_32bit() || self.core.config.force_32bit_allocations;

        if self.core.config.enable_allocation_reuse {
            if let Some(allocation) = self.core.cache.detach_best_fit(size, want_32bit, &self.core.fences) {
                tracing::trace!("reusing allocation {:?} for {} bytes", allocation.id(), size);
                self.core.stats.lock().reused_allocations += 1;
                return Ok(allocation);
            }
        }

        match self.allocate_fresh(size, kind, alignment, want_32bit) {
            Err(DriverError::OutOfMemory { .. }) => {
                tracing::warn!("out of memory for {} bytes, draining deferred deletions", size);
                self.core.stats.lock().oom_retries += 1;
                self.deleter.drain(true)?;
                self.core.reclaim_all();
                self.allocate_fresh(size, kind, alignment, want_32bit)
            }
            other => other,
        }
    }

    fn allocate_fresh(
        &self,
        size: u64,
        kind: AllocationKind,
        alignment: u64,
        want_32bit: bool,
    ) -> DriverResult<Arc<Allocation>> {
        let heap = want_32bit.then(|| {
            let config = &self.core.config.heap32;
            self.core.heap32.get_or_init(|| Heap32::new(config.base, config.size))
        });

        let backing = self.core.backend.reserve(size, alignment)?;
        let mut allocation = Allocation::new(
            self.next_id(),
            size,
            kind,
            backing,
            want_32bit,
            self.core.fences.engine_count(),
        );

        if let Some(heap) = heap {
            let Some(address) = heap.reserve(backing.size, alignment) else {
                self.core.backend.release(backing);
                return Err(DriverError::OutOfMemory { requested: size });
            };
            allocation = allocation.with_gpu_address(address);
        }

        self.core.stats.lock().fresh_allocations += 1;
        Ok(Arc::new(allocation))
    }

    /// Wraps application memory `[ptr, ptr + size)` in an allocation.
    ///
    /// Stored fragments equal to or containing a requested fragment are
    /// shared. A requested fragment that partially overlaps a stored one
    /// is resolved by reclaiming temporary allocations, then by waiting
    /// for every engine to drain and reclaiming again.
    ///
    /// # Errors
    ///
    /// `OverlappingImport` (fatal) if the overlap survives both steps;
    /// wait errors while draining; backend failures.
    pub fn import_host_ptr(&self, ptr: u64, size: u64) -> DriverResult<Arc<Allocation>> {
        if size == 0 {
            return Err(DriverError::InvalidRequest("empty host import".to_string()));
        }
        // The last fragment ends on the page boundary after `ptr + size`.
        if ptr.checked_add(size).and_then(|end| end.checked_add(PAGE_SIZE - 1)).is_none() {
            return Err(DriverError::InvalidRequest(format!(
                "host import {ptr:#x} (+{size:#x}) wraps the address space"
            )));
        }
        let ranges = split_host_range(ptr, size);

        let mut resolution = 0;
        loop {
            match self.core.fragments.try_acquire(&ranges, self.core.backend.as_ref())? {
                FragmentAcquire::Acquired { fragments, reused } => {
                    {
                        let mut stats = self.core.stats.lock();
                        stats.imports += 1;
                        stats.fragments_reused += reused as u64;
                    }
                    let allocation =
                        Allocation::imported(self.next_id(), ptr, size, fragments, self.core.fences.engine_count());
                    return Ok(Arc::new(allocation));
                }
                FragmentAcquire::Conflict(range) => {
                    self.core.stats.lock().overlap_resolutions += 1;
                    match resolution {
                        0 => {
                            tracing::debug!("import {:#x} overlaps {:#x}, reclaiming", ptr, range.address);
                            self.core.reclaim_all();
                        }
                        1 => {
                            tracing::warn!("import {:#x} still overlaps, waiting for device drain", ptr);
                            for engine in self.core.fences.engines() {
                                self.core.fences.wait_for_idle(engine)?;
                            }
                            self.deleter.drain(true)?;
                            self.core.reclaim_all();
                        }
                        _ => {
                            tracing::error!("import {:#x} (+{:#x}) overlaps a live fragment", ptr, size);
                            return Err(DriverError::OverlappingImport { address: ptr, size });
                        }
                    }
                    resolution += 1;
                }
            }
        }
    }

    /// Releases `allocation`.
    ///
    /// Freed immediately when idle; otherwise deferred to the deleter or,
    /// with the deleter disabled, parked in the temporary pool.
    pub fn release(&self, allocation: Arc<Allocation>) {
        self.core.cache.detach(&allocation);

        if self.core.fences.is_idle(&allocation) {
            self.core.free_now(&allocation);
        } else if self.deleter_enabled.load(Ordering::Acquire) {
            self.core.stats.lock().deferred_deletions += 1;
            self.deleter.defer_deletion(Box::new(AllocationDeletion {
                core: Arc::clone(&self.core),
                allocation,
            }));
        } else {
            self.core.stats.lock().temporary_stores += 1;
            self.core.cache.store_temporary(allocation);
        }
    }

    /// Hands `allocation` back for reuse once `fence` retires on `engine`.
    ///
    /// `fence` defaults to the engine's current fence. Host imports, and
    /// everything when reuse is disabled, are released instead.
    ///
    /// # Errors
    ///
    /// `UnknownEngine`.
    pub fn store_for_reuse(
        &self,
        allocation: Arc<Allocation>,
        fence: Option<FenceValue>,
        engine: EngineId,
    ) -> DriverResult<()> {
        self.core.fences.check_engine(engine)?;
        if !self.core.config.enable_allocation_reuse || allocation.kind() == AllocationKind::HostImport {
            self.release(allocation);
            return Ok(());
        }
        let fence = fence.unwrap_or_else(|| self.core.fences.current_fence(engine));
        self.core.cache.store_for_reuse(allocation, engine, fence);
        Ok(())
    }

    /// Parks `allocation` until its fences retire.
    pub fn store_temporary(&self, allocation: Arc<Allocation>) {
        self.core.stats.lock().temporary_stores += 1;
        self.core.cache.store_temporary(allocation);
    }

    /// Frees temporary allocations retired on `engine`.
    ///
    /// # Returns
    ///
    /// How many were freed.
    ///
    /// # Errors
    ///
    /// `UnknownEngine`.
    pub fn reclaim(&self, engine: EngineId) -> DriverResult<usize> {
        self.core.fences.check_engine(engine)?;
        Ok(self.core.reclaim(engine))
    }

    /// Makes `allocations` resident, stamps them with a new fence and
    /// submits `command_buffer` on `engine`.
    ///
    /// # Returns
    ///
    /// The fence the submission will signal.
    ///
    /// # Errors
    ///
    /// `UnknownEngine`, `DeviceLost`, residency errors.
    pub fn submit(
        &self,
        engine: EngineId,
        command_buffer: &[u8],
        allocations: &[Arc<Allocation>],
    ) -> DriverResult<FenceValue> {
        let fences = &self.core.fences;
        fences.check_engine(engine)?;
        if let Some(lost) = fences.lost_engine() {
            return Err(DriverError::DeviceLost { engine: lost });
        }

        let residency = &self.core.residency[engine.index()];
        residency.make_resident(allocations)?;

        let fence = fences.next_fence(engine);
        for allocation in allocations {
            fences.stamp_future(allocation, engine, fence);
        }
        residency.record_submission(allocations);

        let fence = self.device.submit(&Submission {
            engine,
            fence,
            command_buffer,
            residency: allocations,
        })?;
        fences.mark_submitted(engine, fence);
        Ok(fence)
    }

    /// Drains every pending deferred deletion and stops the deleter.
    ///
    /// Later in-flight releases go to the temporary pool. Calling this
    /// again is a no-op.
    ///
    /// # Errors
    ///
    /// `DeviceLost` if a drained deletion observed a device fault.
    pub fn wait_for_deletions(&self) -> DriverResult<()> {
        if !self.deleter_enabled.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.deleter.drain(true);
        self.deleter.remove_client();
        result
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let mut stats = self.core.stats.lock().clone();
        for set in self.core.residency.iter() {
            let residency = set.stats();
            stats.evictions += residency.evictions;
            stats.bytes_evicted += residency.bytes_evicted;
        }
        stats
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let mut leaked = 0usize;
        for allocation in self.core.cache.take_all() {
            if self.core.fences.is_idle(&allocation) {
                self.core.free_now(&allocation);
            } else {
                leaked += 1;
            }
        }
        if leaked > 0 {
            tracing::warn!("{} pooled allocations still in flight at teardown", leaked);
        }
    }
}
