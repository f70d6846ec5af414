//! # Core Vocabulary
//!
//! Small copyable types shared between the allocator, the residency
//! controller and the device layer.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// A per-engine completion counter value ("task count").
///
/// Monotonically non-decreasing per engine and never reused.
pub type FenceValue = u64;

/// Identifies one hardware engine (command queue) of a device.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct EngineId(pub u32);

impl EngineId {
    /// Returns the engine as an index into per-engine tables.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

/// Where an allocation's memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryPool {
    /// Device-local memory, not CPU visible.
    DeviceLocal,
    /// System memory owned by the driver.
    Host,
    /// System memory supplied by the application (host-pointer import).
    Shared,
}

/// What an allocation is used for.
///
/// The kind decides the pool and whether the allocation must be
/// addressable with 32 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationKind {
    /// Generic buffer.
    Buffer,
    /// Command buffer consumed by an engine.
    CommandBuffer,
    /// Heap referenced by 32-bit offsets (kernel ISA, dynamic state).
    InternalHeap,
    /// Per-invocation scratch backing.
    Scratch,
    /// Imported application memory.
    HostImport,
}

impl AllocationKind {
    /// Returns true if the allocation must live below 4 GiB of GPU VA.
    #[inline]
    #[must_use]
    pub const fn requires_32bit(self) -> bool {
        matches!(self, Self::InternalHeap)
    }

    /// Default pool for this kind.
    #[must_use]
    pub const fn pool(self) -> MemoryPool {
        match self {
            Self::Buffer | Self::Scratch => MemoryPool::DeviceLocal,
            Self::CommandBuffer | Self::InternalHeap => MemoryPool::Host,
            Self::HostImport => MemoryPool::Shared,
        }
    }
}
