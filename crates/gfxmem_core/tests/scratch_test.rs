//! Integration tests for scratch space growth and descriptor upkeep.

use gfxmem_core::config::ScratchConfig;
use gfxmem_core::scratch::{DESCRIPTOR_FLAG_PRIVATE, DESCRIPTOR_FLAG_VALID, DESCRIPTOR_SIZE};
use gfxmem_core::{
    DescriptorHeap, DriverError, HostBackend, MemoryConfig, MemoryManager, ScratchDirty, ScratchSpaceController,
};
use gfxmem_shared::EngineId;
use std::sync::Arc;

const E: EngineId = EngineId(0);

fn setup() -> (MemoryManager, ScratchSpaceController, DescriptorHeap) {
    let config = MemoryConfig::default();
    let controller = ScratchSpaceController::new(&config.scratch);
    let (mm, _device, _backend) = MemoryManager::simulated(config).unwrap();
    (mm, controller, DescriptorHeap::new(0x9000_0000, 4096))
}

#[test]
fn test_growth_advances_slot_and_replaces_backing() {
    let (mm, mut scratch, mut heap) = setup();

    let dirty = scratch.ensure(&mm, &mut heap, 0, 0x1000, 0, E).unwrap();
    assert!(dirty.backing_changed);
    let first_slot = scratch.slot_id();
    let first_address = scratch.scratch_allocation().unwrap().gpu_address();

    let dirty = scratch.ensure(&mm, &mut heap, 0, 0x2000, 0, E).unwrap();
    assert!(dirty.backing_changed);
    assert!(scratch.slot_id() > first_slot);
    let allocation = scratch.scratch_allocation().unwrap();
    assert_ne!(allocation.gpu_address(), first_address);
    assert_eq!(scratch.per_unit_size(), 0x2000);
    assert_eq!(allocation.aligned_size(), 0x2000 * ScratchConfig::default().compute_unit_count);

    // The previous backing waits for the GPU in the temporary pool.
    assert_eq!(mm.cache().temporary_len(), 1);

    let descriptor = heap.read(scratch.offset_for_slot(scratch.slot_id())).unwrap();
    assert_eq!(descriptor.base_address, allocation.gpu_address());
    assert_eq!(descriptor.per_unit_size, 0x2000);
    assert_eq!(descriptor.flags & DESCRIPTOR_FLAG_VALID, DESCRIPTOR_FLAG_VALID);
}

#[test]
fn test_satisfied_request_is_noop() {
    let (mm, mut scratch, mut heap) = setup();
    scratch.ensure(&mm, &mut heap, 0, 0x2000, 0, E).unwrap();
    let slot = scratch.slot_id();

    assert_eq!(scratch.ensure(&mm, &mut heap, 0, 0x2000, 0, E).unwrap(), ScratchDirty::default());
    assert_eq!(scratch.ensure(&mm, &mut heap, 0, 0x800, 0, E).unwrap(), ScratchDirty::default());
    assert_eq!(scratch.slot_id(), slot);
    assert_eq!(mm.stats().fresh_allocations, 1);
}

#[test]
fn test_heap_change_copies_descriptors() {
    let (mm, mut scratch, mut heap) = setup();
    scratch.ensure(&mm, &mut heap, 0, 0x1000, 0, E).unwrap();
    let offset = scratch.offset_for_slot(scratch.slot_id());

    let mut next_heap = DescriptorHeap::new(0xA000_0000, 4096);
    let dirty = scratch.ensure(&mm, &mut next_heap, 0, 0x1000, 0, E).unwrap();

    assert_eq!(dirty, ScratchDirty { backing_changed: false, heap_changed: true });
    assert_eq!(next_heap.read(offset), heap.read(offset));

    // Same heap again: nothing to do.
    assert!(!scratch.ensure(&mm, &mut next_heap, 0, 0x1000, 0, E).unwrap().any());
}

#[test]
fn test_private_scratch_uses_second_half_of_slot() {
    let (mm, mut scratch, mut heap) = setup();

    scratch.ensure(&mm, &mut heap, 0, 0x1000, 0x400, E).unwrap();

    let private = scratch.private_allocation().unwrap();
    let offset = scratch.offset_for_slot(scratch.slot_id());
    let descriptor = heap.read(offset + DESCRIPTOR_SIZE).unwrap();
    assert_eq!(descriptor.base_address, private.gpu_address());
    assert_eq!(descriptor.flags, DESCRIPTOR_FLAG_VALID | DESCRIPTOR_FLAG_PRIVATE);
}

#[test]
fn test_pinned_slot_is_reused() {
    let (mm, mut scratch, mut heap) = setup();
    scratch.set_update_slots(false);

    scratch.ensure(&mm, &mut heap, 5, 0x1000, 0, E).unwrap();
    assert_eq!(scratch.slot_id(), 5);
    scratch.ensure(&mm, &mut heap, 5, 0x4000, 0, E).unwrap();
    assert_eq!(scratch.slot_id(), 5);

    scratch.set_update_slots(true);
    scratch.ensure(&mm, &mut heap, 0, 0x8000, 0, E).unwrap();
    assert_eq!(scratch.slot_id(), 6);
}

#[test]
fn test_reset_rewrites_descriptors() {
    let (mm, mut scratch, mut heap) = setup();
    scratch.ensure(&mm, &mut heap, 0, 0x1000, 0, E).unwrap();
    scratch.ensure(&mm, &mut heap, 0, 0x2000, 0, E).unwrap();

    scratch.reset();
    assert_eq!(scratch.slot_id(), 0);

    let dirty = scratch.ensure(&mm, &mut heap, 0, 0x1000, 0, E).unwrap();
    assert!(dirty.heap_changed);
    assert!(heap.read(0).unwrap().flags & DESCRIPTOR_FLAG_VALID != 0);
}

#[test]
fn test_small_heap_rejected() {
    let (mm, mut scratch, _) = setup();
    let mut tiny = DescriptorHeap::new(0x9000_0000, DESCRIPTOR_SIZE);

    let err = scratch.ensure(&mm, &mut tiny, 0, 0x1000, 0, E).unwrap_err();

    assert!(matches!(err, DriverError::DescriptorHeapTooSmall { .. }));
    assert!(scratch.scratch_allocation().is_none());
}

#[test]
fn test_unknown_engine_rejected() {
    let (mm, mut scratch, mut heap) = setup();
    assert_eq!(
        scratch.ensure(&mm, &mut heap, 0, 0x1000, 0, EngineId(3)).unwrap_err(),
        DriverError::UnknownEngine(EngineId(3))
    );
}

fn setup_with_memory(bytes: u64) -> (MemoryManager, Arc<HostBackend>, ScratchSpaceController, DescriptorHeap) {
    let config = MemoryConfig { device_memory_bytes: bytes, ..MemoryConfig::default() };
    let controller = ScratchSpaceController::new(&config.scratch);
    let (mm, _device, backend) = MemoryManager::simulated(config).unwrap();
    (mm, backend, controller, DescriptorHeap::new(0x9000_0000, 4096))
}

#[test]
fn test_failed_private_growth_keeps_previous_backings() {
    let (mm, backend, mut scratch, mut heap) = setup_with_memory(1 << 20);
    scratch.ensure(&mm, &mut heap, 0, 0x1000, 0x400, E).unwrap();
    let slot = scratch.slot_id();
    let shared_address = scratch.scratch_allocation().unwrap().gpu_address();
    let descriptor = heap.read(scratch.offset_for_slot(slot)).unwrap();
    assert_eq!(backend.live_count(), 2);

    // Shared growth fits, private growth cannot.
    let err = scratch.ensure(&mm, &mut heap, 0, 0x2000, 0x10_0000, E).unwrap_err();

    assert!(matches!(err, DriverError::OutOfMemory { .. }));
    assert_eq!(scratch.slot_id(), slot);
    assert_eq!(scratch.per_unit_size(), 0x1000);
    assert_eq!(scratch.scratch_allocation().unwrap().gpu_address(), shared_address);
    assert_eq!(heap.read(scratch.offset_for_slot(slot)), Some(descriptor));
    assert_eq!(backend.live_count(), 2, "the unused shared backing was released");
    assert_eq!(mm.cache().temporary_len(), 0);
}

#[test]
fn test_oversized_per_unit_size_rejected() {
    let (mm, mut scratch, mut heap) = setup();

    let err = scratch.ensure(&mm, &mut heap, 0, 1 << 32, 0, E).unwrap_err();
    assert!(matches!(err, DriverError::InvalidRequest(_)));
    let err = scratch.ensure(&mm, &mut heap, 0, 0x1000, 1 << 32, E).unwrap_err();
    assert!(matches!(err, DriverError::InvalidRequest(_)));

    assert!(scratch.scratch_allocation().is_none());
    assert_eq!(mm.stats().fresh_allocations, 0);
}
