//! # Allocation Backends
//!
//! The OS-facing capability set the core allocates through. Platform
//! variants implement [`AllocationBackend`]; one is picked at device
//! creation and shared as `Arc<dyn AllocationBackend>`.
//!
//! ```text
//!   MemoryManager ──reserve/release──┐
//!   FragmentRegistry ──populate──────┼──> dyn AllocationBackend
//!   ResidencySet ──make_resident/evict┘
//! ```

pub mod host;

pub use host::HostBackend;

use crate::error::DriverError;
use crate::memory::FragmentRange;
use thiserror::Error;

/// Device memory handle returned by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Backing {
    /// Backend-specific handle.
    pub handle: u64,
    /// GPU virtual address.
    pub gpu_address: u64,
    /// Size in bytes (page multiple).
    pub size: u64,
}

/// Failures a backend may report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// No memory left for the request.
    #[error("backend out of memory: requested {requested} bytes")]
    OutOfMemory {
        /// Bytes requested.
        requested: u64,
    },

    /// Mapping would exceed the platform residency budget.
    #[error("residency budget exceeded by {bytes} bytes")]
    OverBudget {
        /// Bytes over budget.
        bytes: u64,
    },

    /// Platform-specific failure.
    #[error("transient backend failure: {0}")]
    Transient(String),
}

impl From<BackendError> for DriverError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::OutOfMemory { requested } => Self::OutOfMemory { requested },
            BackendError::OverBudget { bytes } => Self::BudgetExhausted { bytes_over: bytes },
            BackendError::Transient(reason) => Self::Backend(reason),
        }
    }
}

/// OS allocation primitives.
///
/// Implementations must be callable from any thread. None of the methods
/// may block on device progress.
pub trait AllocationBackend: Send + Sync + std::fmt::Debug {
    /// Reserves `size` bytes of device memory.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when exhausted, `Transient` for platform failures.
    fn reserve(&self, size: u64, alignment: u64) -> Result<Backing, BackendError>;

    /// CPU pointer to the backing, if it is CPU visible.
    fn map_cpu(&self, backing: &Backing) -> Option<u64>;

    /// Returns the backing to the OS. The device must no longer use it.
    fn release(&self, backing: Backing);

    /// Creates device handles for imported host ranges.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` or `Transient` if any range cannot be registered.
    fn populate_fragments(&self, ranges: &[FragmentRange]) -> Result<Vec<Backing>, BackendError>;

    /// Maps `units` into the device working set.
    ///
    /// With `force`, the budget is ignored.
    ///
    /// # Errors
    ///
    /// `OverBudget` with the overrun when not forced.
    fn make_resident(&self, units: &[Backing], force: bool) -> Result<(), BackendError>;

    /// Unmaps `units` from the working set.
    fn evict(&self, units: &[Backing]);
}
