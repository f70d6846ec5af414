//! # Host Backend
//!
//! OS-agnostic backend that simulates a device address space in host
//! bookkeeping: a bump-allocated GPU VA range, a capacity limit, and a
//! residency budget. Used when no platform backend is available and by
//! every test in the workspace.

use super::{AllocationBackend, BackendError, Backing};
use crate::memory::FragmentRange;
use gfxmem_shared::{align_up, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;

/// First GPU address handed out; above the 32-bit heap.
const VA_BASE: u64 = 0x1_0000_0000;

#[derive(Debug)]
struct LiveBacking {
    backing: Backing,
    counts_against_capacity: bool,
}

#[derive(Debug)]
struct HostState {
    next_address: u64,
    next_handle: u64,
    capacity: u64,
    reserved_bytes: u64,
    budget: u64,
    resident_bytes: u64,
    live: HashMap<u64, LiveBacking>,
    /// handle -> number of residency sets mapping it
    resident: HashMap<u64, u32>,
    failures_pending: u32,
    released: u64,
}

/// Simulated OS allocation backend.
#[derive(Debug)]
pub struct HostBackend {
    state: Mutex<HostState>,
}

impl HostBackend {
    /// Creates a backend with `capacity` bytes of device memory and a
    /// residency budget of `budget` bytes.
    #[must_use]
    pub fn new(capacity: u64, budget: u64) -> Self {
        Self {
            state: Mutex::new(HostState {
                next_address: VA_BASE,
                next_handle: 1,
                capacity,
                reserved_bytes: 0,
                budget,
                resident_bytes: 0,
                live: HashMap::new(),
                resident: HashMap::new(),
                failures_pending: 0,
                released: 0,
            }),
        }
    }

    /// Makes the next `count` reservations fail with `OutOfMemory`.
    pub fn fail_next_reserves(&self, count: u32) {
        self.state.lock().failures_pending = count;
    }

    /// Changes the residency budget.
    pub fn set_budget(&self, budget: u64) {
        self.state.lock().budget = budget;
    }

    /// Bytes currently mapped.
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().resident_bytes
    }

    /// Bytes reserved against capacity.
    #[must_use]
    pub fn reserved_bytes(&self) -> u64 {
        self.state.lock().reserved_bytes
    }

    /// Backings not yet released.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Backings released so far.
    #[must_use]
    pub fn released_count(&self) -> u64 {
        self.state.lock().released
    }

    /// True if `backing` is mapped by at least one residency set.
    #[must_use]
    pub fn is_resident(&self, backing: &Backing) -> bool {
        self.state.lock().resident.contains_key(&backing.handle)
    }
}

impl HostState {
    fn bump(&mut self, size: u64, alignment: u64, counts_against_capacity: bool) -> Backing {
        let gpu_address = align_up(self.next_address, alignment.max(PAGE_SIZE));
        self.next_address = gpu_address + size;
        let backing = Backing { handle: self.next_handle, gpu_address, size };
        self.next_handle += 1;
        if counts_against_capacity {
            self.reserved_bytes += size;
        }
        self.live.insert(backing.handle, LiveBacking { backing, counts_against_capacity });
        backing
    }

    fn unmap(&mut self, handle: u64, size: u64) {
        if let Some(count) = self.resident.get_mut(&handle) {
            *count -= 1;
            if *count == 0 {
                self.resident.remove(&handle);
                self.resident_bytes -= size;
            }
        }
    }
}

impl AllocationBackend for HostBackend {
    fn reserve(&self, size: u64, alignment: u64) -> Result<Backing, BackendError> {
        let size = align_up(size.max(1), PAGE_SIZE);
        let mut state = self.state.lock();

        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(BackendError::OutOfMemory { requested: size });
        }
        if state.reserved_bytes + size > state.capacity {
            return Err(BackendError::OutOfMemory { requested: size });
        }
        Ok(state.bump(size, alignment, true))
    }

    fn map_cpu(&self, backing: &Backing) -> Option<u64> {
        let state = self.state.lock();
        state.live.contains_key(&backing.handle).then_some(backing.gpu_address)
    }

    fn release(&self, backing: Backing) {
        let mut state = self.state.lock();
        if let Some(live) = state.live.remove(&backing.handle) {
            if live.counts_against_capacity {
                state.reserved_bytes -= live.backing.size;
            }
            if let Some(count) = state.resident.remove(&backing.handle) {
                debug_assert!(count > 0);
                state.resident_bytes -= live.backing.size;
                tracing::warn!("released backing {} while still resident", backing.handle);
            }
            state.released += 1;
        }
    }

    fn populate_fragments(&self, ranges: &[FragmentRange]) -> Result<Vec<Backing>, BackendError> {
        let mut state = self.state.lock();
        Ok(ranges.iter().map(|range| state.bump(range.size, PAGE_SIZE, false)).collect())
    }

    fn make_resident(&self, units: &[Backing], force: bool) -> Result<(), BackendError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let new_bytes: u64 = units
            .iter()
            .filter(|unit| !state.resident.contains_key(&unit.handle))
            .map(|unit| unit.size)
            .sum();

        let total = state.resident_bytes + new_bytes;
        if !force && total > state.budget {
            return Err(BackendError::OverBudget { bytes: total - state.budget });
        }

        for unit in units {
            let count = state.resident.entry(unit.handle).or_insert(0);
            if *count == 0 {
                state.resident_bytes += unit.size;
            }
            *count += 1;
        }
        Ok(())
    }

    fn evict(&self, units: &[Backing]) {
        let mut state = self.state.lock();
        for unit in units {
            state.unmap(unit.handle, unit.size);
        }
    }
}
