//! # Synchronization
//!
//! Completion tracking between the CPU and asynchronously executing
//! engines, and the background worker that frees memory once the device
//! is done with it.

pub mod deleter;
pub mod fence;

pub use deleter::{DeferrableDeletion, DeferredDeleter, DeleterLifecycle, DeletionOutcome};
pub use fence::{CancelToken, FenceTag, FenceTracker, WaitPolicy};
