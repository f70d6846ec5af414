//! # GFXMEM Core
//!
//! Resource-lifecycle core of a GPU compute driver. Decides when device
//! memory may be reused, moved out of residency or destroyed, given that
//! the GPU consumes it asynchronously.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌─────────────────┐
//!   application ──────>│  MemoryManager  │──────> Device (submit)
//!                      └────────┬────────┘
//!          ┌──────────────┬─────┴────────┬──────────────────┐
//!          ▼              ▼              ▼                  ▼
//!   AllocationCache  FragmentRegistry  ResidencySet[e]  DeferredDeleter
//!          │              │              │                  │
//!          └──────────────┴──────┬───────┴──────────────────┘
//!                                ▼
//!                 FenceTracker + dyn AllocationBackend
//! ```
//!
//! ## Rules
//!
//! 1. **Nothing is freed or evicted before its fence retires**
//! 2. **No lock is held across a fence wait**
//! 3. **Cache misses and budget overruns are handled internally**
//!
//! ## Example
//!
//! ```rust,ignore
//! use gfxmem_core::{MemoryConfig, MemoryManager};
//! use gfxmem_shared::{AllocationKind, EngineId, PAGE_SIZE};
//!
//! let (manager, device, _backend) = MemoryManager::simulated(MemoryConfig::default())?;
//! let buffer = manager.acquire(64 << 10, AllocationKind::Buffer, PAGE_SIZE)?;
//! let fence = manager.submit(EngineId(0), &commands, &[buffer.clone()])?;
//! manager.store_for_reuse(buffer, Some(fence), EngineId(0))?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod memory;
pub mod residency;
pub mod scratch;
pub mod stats;
pub mod sync;

pub use backend::{AllocationBackend, BackendError, Backing, HostBackend};
pub use config::MemoryConfig;
pub use device::{CompletionMode, Device, SimulatedDevice, Submission, SubmissionRecord};
pub use error::{DriverError, DriverResult};
pub use manager::MemoryManager;
pub use memory::{Allocation, AllocationCache, AllocationId, CachePool, Fragment, FragmentRange, OverlapStatus};
pub use residency::{ResidencySet, ResidencyStats};
pub use scratch::{DescriptorHeap, ScratchDescriptor, ScratchDirty, ScratchSpaceController};
pub use stats::MemoryStats;
pub use sync::{CancelToken, DeferredDeleter, FenceTracker, WaitPolicy};
