//! # Scratch Space Controller
//!
//! Grows per-invocation scratch memory on demand and keeps the
//! hardware-visible descriptors pointing at it.
//!
//! ## Slot Layout
//!
//! The descriptor heap is owned by the command encoder. Each slot holds a
//! shared-scratch descriptor, followed by a private-scratch descriptor
//! when private scratch is enabled:
//!
//! ```text
//!   offset = slot * slot_width
//!
//!   ┌──────── slot 0 ────────┬──────── slot 1 ────────┬─ ...
//!   │ shared desc │ priv desc│ shared desc │ priv desc│
//!   └─────────────┴──────────┴─────────────┴──────────┘
//! ```
//!
//! Growing the backing moves to a fresh slot so descriptors still read by
//! in-flight work stay intact. The old backing is parked as temporary and
//! freed once its fences retire.

use crate::config::ScratchConfig;
use crate::error::{DriverError, DriverResult};
use crate::manager::MemoryManager;
use crate::memory::Allocation;
use bytemuck::{Pod, Zeroable};
use gfxmem_shared::{AllocationKind, EngineId, PAGE_SIZE};
use std::sync::Arc;

/// Descriptor is valid.
pub const DESCRIPTOR_FLAG_VALID: u32 = 1;
/// Descriptor addresses private scratch.
pub const DESCRIPTOR_FLAG_PRIVATE: u32 = 1 << 1;

/// Hardware-visible scratch descriptor.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ScratchDescriptor {
    /// GPU address of the backing.
    pub base_address: u64,
    /// Backing capacity in bytes.
    pub capacity: u64,
    /// Bytes per compute unit.
    pub per_unit_size: u32,
    /// `DESCRIPTOR_FLAG_*` bits.
    pub flags: u32,
}

/// Size of one descriptor in the heap.
pub const DESCRIPTOR_SIZE: usize = std::mem::size_of::<ScratchDescriptor>();

/// Per-unit size as stored in a descriptor.
fn descriptor_unit_size(per_unit: u64) -> DriverResult<u32> {
    u32::try_from(per_unit).map_err(|_| {
        DriverError::InvalidRequest(format!("scratch size {per_unit:#x} per unit exceeds the descriptor field"))
    })
}

/// Caller-owned buffer of hardware descriptors.
#[derive(Clone, Debug)]
pub struct DescriptorHeap {
    base_address: u64,
    bytes: Vec<u8>,
}

impl DescriptorHeap {
    /// Creates a zeroed heap at GPU address `base_address`.
    #[must_use]
    pub fn new(base_address: u64, size: usize) -> Self {
        Self { base_address, bytes: vec![0; size] }
    }

    /// GPU address of the heap.
    #[must_use]
    pub const fn base_address(&self) -> u64 {
        self.base_address
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-sized heap.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Descriptor stored at `offset`.
    #[must_use]
    pub fn read(&self, offset: usize) -> Option<ScratchDescriptor> {
        let bytes = self.bytes.get(offset..offset + DESCRIPTOR_SIZE)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    fn write(&mut self, offset: usize, descriptor: &ScratchDescriptor) -> DriverResult<()> {
        let available = self.bytes.len();
        let target = self
            .bytes
            .get_mut(offset..offset + DESCRIPTOR_SIZE)
            .ok_or(DriverError::DescriptorHeapTooSmall { required: offset + DESCRIPTOR_SIZE, available })?;
        target.copy_from_slice(bytemuck::bytes_of(descriptor));
        Ok(())
    }
}

/// What the consumer must reprogram after [`ScratchSpaceController::ensure`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScratchDirty {
    /// A new backing (and slot) is in use.
    pub backing_changed: bool,
    /// The descriptors were copied into a new heap.
    pub heap_changed: bool,
}

impl ScratchDirty {
    /// True if anything must be re-emitted.
    #[must_use]
    pub const fn any(self) -> bool {
        self.backing_changed || self.heap_changed
    }
}

/// Slot-indexed growable scratch allocation.
#[derive(Debug)]
pub struct ScratchSpaceController {
    compute_units: u64,
    private_enabled: bool,
    base_slot_count: u32,
    slot_count: u32,
    slot_id: u32,
    update_slots: bool,
    per_unit_size: u64,
    private_per_unit_size: u64,
    scratch: Option<Arc<Allocation>>,
    private_scratch: Option<Arc<Allocation>>,
    heap_base: Option<u64>,
    /// Last descriptors written, copied verbatim on heap changes.
    slot_descriptors: (ScratchDescriptor, ScratchDescriptor),
}

impl ScratchSpaceController {
    /// Creates a controller with no backing.
    #[must_use]
    pub fn new(config: &ScratchConfig) -> Self {
        let multiplier = if config.private_scratch_enabled { 2 } else { 1 };
        Self {
            compute_units: config.compute_unit_count,
            private_enabled: config.private_scratch_enabled,
            base_slot_count: config.base_slot_count,
            slot_count: config.base_slot_count * multiplier,
            slot_id: 0,
            update_slots: true,
            per_unit_size: 0,
            private_per_unit_size: 0,
            scratch: None,
            private_scratch: None,
            heap_base: None,
            slot_descriptors: (ScratchDescriptor::default(), ScratchDescriptor::default()),
        }
    }

    /// Bytes between consecutive slots.
    #[inline]
    #[must_use]
    pub const fn slot_width(&self) -> usize {
        if self.private_enabled {
            2 * DESCRIPTOR_SIZE
        } else {
            DESCRIPTOR_SIZE
        }
    }

    /// Heap offset of slot `id`.
    #[inline]
    #[must_use]
    pub const fn offset_for_slot(&self, id: u32) -> usize {
        id as usize * self.slot_width()
    }

    /// Current slot.
    #[must_use]
    pub const fn slot_id(&self) -> u32 {
        self.slot_id
    }

    /// Addressable slots before the count doubles.
    #[must_use]
    pub const fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Per-unit shared scratch size currently backed.
    #[must_use]
    pub const fn per_unit_size(&self) -> u64 {
        self.per_unit_size
    }

    /// Shared scratch backing.
    #[must_use]
    pub fn scratch_allocation(&self) -> Option<&Arc<Allocation>> {
        self.scratch.as_ref()
    }

    /// Private scratch backing.
    #[must_use]
    pub fn private_allocation(&self) -> Option<&Arc<Allocation>> {
        self.private_scratch.as_ref()
    }

    /// Pins (`false`) or unpins the slot id. While pinned, growth reuses
    /// the caller's slot hint instead of advancing.
    pub fn set_update_slots(&mut self, update_slots: bool) {
        self.update_slots = update_slots;
    }

    /// Wraps the slot id back to zero. The next `ensure` rewrites the
    /// descriptors.
    pub fn reset(&mut self) {
        let multiplier = if self.private_enabled { 2 } else { 1 };
        self.slot_id = 0;
        self.slot_count = self.base_slot_count * multiplier;
        self.heap_base = None;
    }

    /// Makes sure scratch covers the requirement and the heap describes it.
    ///
    /// # Arguments
    ///
    /// * `heap` - Descriptor heap currently bound by the encoder
    /// * `slot_hint` - Lowest slot to use; the exact slot while pinned
    /// * `required_size` - Shared scratch bytes per compute unit
    /// * `required_private_size` - Private scratch bytes per compute unit
    /// * `engine` - Engine that will consume the scratch
    ///
    /// # Returns
    ///
    /// Which hardware state must be re-emitted.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if a per-unit size does not fit a descriptor;
    /// `DescriptorHeapTooSmall` if the slot does not fit in `heap`;
    /// allocation errors from the manager. On error no backing is
    /// replaced.
    pub fn ensure(
        &mut self,
        manager: &MemoryManager,
        heap: &mut DescriptorHeap,
        slot_hint: u32,
        required_size: u64,
        required_private_size: u64,
        engine: EngineId,
    ) -> DriverResult<ScratchDirty> {
        manager.fences().check_engine(engine)?;
        descriptor_unit_size(required_size)?;
        descriptor_unit_size(required_private_size)?;
        let grow_shared = required_size > self.per_unit_size;
        let grow_private = self.private_enabled && required_private_size > self.private_per_unit_size;

        if grow_shared || grow_private {
            let slot = if self.update_slots { self.next_slot(slot_hint) } else { slot_hint };
            let required = self.offset_for_slot(slot) + self.slot_width();
            if required > heap.len() {
                return Err(DriverError::DescriptorHeapTooSmall { required, available: heap.len() });
            }

            let shared = if grow_shared { Some(self.grow(manager, required_size)?) } else { None };
            let private = if grow_private {
                match self.grow(manager, required_private_size) {
                    Ok(fresh) => Some(fresh),
                    Err(e) => {
                        if let Some(unused) = shared {
                            manager.release(unused);
                        }
                        return Err(e);
                    }
                }
            } else {
                None
            };

            if let Some(fresh) = shared {
                if let Some(old) = self.scratch.replace(fresh) {
                    manager.store_temporary(old);
                }
                self.per_unit_size = required_size;
            }
            if let Some(fresh) = private {
                if let Some(old) = self.private_scratch.replace(fresh) {
                    manager.store_temporary(old);
                }
                self.private_per_unit_size = required_private_size;
            }

            self.slot_id = slot;
            self.slot_descriptors = self.build_descriptors()?;
            self.write_slot(heap)?;
            tracing::debug!(
                "scratch grown to {:#x}/{:#x} per unit, slot {} on {}",
                self.per_unit_size,
                self.private_per_unit_size,
                slot,
                engine
            );
            return Ok(ScratchDirty { backing_changed: true, heap_changed: false });
        }

        let has_backing = self.scratch.is_some() || self.private_scratch.is_some();
        if has_backing && self.heap_base != Some(heap.base_address()) {
            self.write_slot(heap)?;
            return Ok(ScratchDirty { backing_changed: false, heap_changed: true });
        }

        Ok(ScratchDirty::default())
    }

    /// Next slot at or after `hint`, doubling the count when exhausted.
    fn next_slot(&mut self, hint: u32) -> u32 {
        let slot = (self.slot_id + 1).max(hint);
        while slot >= self.slot_count {
            self.slot_count *= 2;
        }
        slot
    }

    fn grow(&self, manager: &MemoryManager, per_unit: u64) -> DriverResult<Arc<Allocation>> {
        let capacity = per_unit
            .checked_mul(self.compute_units)
            .ok_or(DriverError::OutOfMemory { requested: u64::MAX })?;
        manager.acquire(capacity, AllocationKind::Scratch, PAGE_SIZE)
    }

    fn build_descriptors(&self) -> DriverResult<(ScratchDescriptor, ScratchDescriptor)> {
        let describe = |allocation: Option<&Arc<Allocation>>, per_unit: u64, flags: u32| -> DriverResult<ScratchDescriptor> {
            let Some(a) = allocation else {
                return Ok(ScratchDescriptor::default());
            };
            Ok(ScratchDescriptor {
                base_address: a.gpu_address(),
                capacity: a.aligned_size(),
                per_unit_size: descriptor_unit_size(per_unit)?,
                flags: flags | DESCRIPTOR_FLAG_VALID,
            })
        };
        Ok((
            describe(self.scratch.as_ref(), self.per_unit_size, 0)?,
            describe(self.private_scratch.as_ref(), self.private_per_unit_size, DESCRIPTOR_FLAG_PRIVATE)?,
        ))
    }

    /// Copies the cached descriptors into `heap` at the current slot.
    fn write_slot(&mut self, heap: &mut DescriptorHeap) -> DriverResult<()> {
        let offset = self.offset_for_slot(self.slot_id);
        heap.write(offset, &self.slot_descriptors.0)?;
        if self.private_enabled {
            heap.write(offset + DESCRIPTOR_SIZE, &self.slot_descriptors.1)?;
        }
        self.heap_base = Some(heap.base_address());
        Ok(())
    }
}
