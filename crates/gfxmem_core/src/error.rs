//! # Driver Error Types
//!
//! Only conditions with no internal remedy end up here. Cache misses and
//! budget overruns are resolved by retry or eviction and never surface.

use gfxmem_shared::{EngineId, FenceValue};
use thiserror::Error;

/// Errors surfaced by the memory core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Backing memory exhausted even after draining deferred deletions.
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory {
        /// Bytes requested by the failing call.
        requested: u64,
    },

    /// A host-pointer import overlaps a live fragment that could not be
    /// reconciled after reclaiming and draining the device.
    #[error("host import at {address:#x} (+{size:#x}) overlaps a live fragment")]
    OverlappingImport {
        /// Start of the requested host range.
        address: u64,
        /// Size of the requested host range.
        size: u64,
    },

    /// The device reported an unrecoverable fault.
    #[error("device lost on {engine}")]
    DeviceLost {
        /// Engine whose fence tag reported the fault.
        engine: EngineId,
    },

    /// A bounded fence wait elapsed.
    #[error("timed out waiting for fence {target} on {engine} (retired {retired})")]
    Timeout {
        /// Engine waited on.
        engine: EngineId,
        /// Fence that had to retire.
        target: FenceValue,
        /// Fence observed when the wait gave up.
        retired: FenceValue,
    },

    /// A cancellable wait was abandoned by its token.
    #[error("wait for fence {target} on {engine} cancelled")]
    Cancelled {
        /// Engine waited on.
        engine: EngineId,
        /// Fence that had to retire.
        target: FenceValue,
    },

    /// Residency could not be established even with forced mapping.
    #[error("residency budget exhausted: {bytes_over} bytes over")]
    BudgetExhausted {
        /// Bytes the platform reported over budget.
        bytes_over: u64,
    },

    /// Scratch slot addressing exceeds the caller's descriptor heap.
    #[error("descriptor heap too small: need {required} bytes, have {available}")]
    DescriptorHeapTooSmall {
        /// Bytes needed to address the slot.
        required: usize,
        /// Bytes in the heap.
        available: usize,
    },

    /// Engine id outside the device's engine table.
    #[error("unknown engine: {0}")]
    UnknownEngine(EngineId),

    /// Malformed request (zero size, bad alignment).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration file or value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backend failure that is neither exhaustion nor a budget overrun.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl DriverError {
    /// Returns true if the error invalidates in-flight work or device state.
    ///
    /// `OverlappingImport` means two live GPU-visible ranges alias each
    /// other; callers must abort rather than continue.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::OverlappingImport { .. } | Self::DeviceLost { .. })
    }

    /// Returns true if retrying the same call later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled { .. })
    }
}

/// Result type for memory core operations.
pub type DriverResult<T> = Result<T, DriverError>;
