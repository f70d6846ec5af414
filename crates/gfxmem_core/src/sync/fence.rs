//! # Fence Tracking
//!
//! Per-engine monotonic completion counters.
//!
//! ## Architecture
//!
//! ```text
//!   submit path                      device
//!   ───────────                      ──────
//!   next_fence() ──> current          FenceTag.retired  <── written on completion
//!   mark_submitted() ──> last_submitted       │
//!                                             ▼
//!   is_retired(alloc) = alloc.last_fence <= retired
//! ```
//!
//! `current` is the last fence handed to a submission. `last_submitted` is
//! the last fence actually queued on the engine. `retired` is the last
//! fence the device finished. For every engine:
//! `retired <= last_submitted <= current` once submissions settle.
//!
//! ## Waiting
//!
//! Waits poll the CPU-visible tag: a short spin, then sleeps with
//! exponential backoff bounded by [`WaitPolicy`]. A wait ends with success,
//! `DeviceLost`, `Timeout`, or `Cancelled`. Waits never mutate state, so a
//! failed wait can be retried.

use crate::config::WaitConfig;
use crate::error::{DriverError, DriverResult};
use crate::memory::Allocation;
use gfxmem_shared::{EngineId, FenceValue, FENCE_NEVER_USED};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// CPU-visible completion location for one engine.
///
/// The device (or its simulation) writes here; everyone else reads.
#[derive(Debug, Default)]
pub struct FenceTag {
    retired: AtomicU64,
    lost: AtomicBool,
}

impl FenceTag {
    /// Records that the device finished work up to `fence`.
    ///
    /// Never moves backwards.
    #[inline]
    pub fn signal(&self, fence: FenceValue) {
        self.retired.fetch_max(fence, Ordering::AcqRel);
    }

    /// Last retired fence.
    #[inline]
    #[must_use]
    pub fn retired(&self) -> FenceValue {
        self.retired.load(Ordering::Acquire)
    }

    /// Signals an unrecoverable device fault.
    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    /// Returns true once the device reported a fault.
    #[inline]
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

/// How a fence wait polls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Busy-spin iterations before the first sleep.
    pub spin_iterations: u32,
    /// First sleep between polls.
    pub poll_interval: Duration,
    /// Sleep cap for exponential backoff.
    pub max_backoff: Duration,
    /// Overall timeout; `None` waits until retirement or device loss.
    pub timeout: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::from_config(&WaitConfig::default())
    }
}

impl WaitPolicy {
    /// Builds a policy from the `[wait]` config section.
    #[must_use]
    pub fn from_config(config: &WaitConfig) -> Self {
        Self {
            spin_iterations: 64,
            poll_interval: config.poll_interval(),
            max_backoff: config.max_backoff(),
            timeout: config.timeout(),
        }
    }

    /// Same policy with a different timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Shared flag that abandons a pending wait.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Abandons every wait observing this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Counters for one engine.
#[derive(Debug, Default)]
struct EngineFences {
    tag: Arc<FenceTag>,
    current: AtomicU64,
    last_submitted: AtomicU64,
}

/// Per-engine fence bookkeeping shared by every component.
///
/// # Thread Safety
///
/// All state is atomic. Any thread may read. Only the submission path that
/// owns an engine advances its `current` and `last_submitted` values.
#[derive(Debug)]
pub struct FenceTracker {
    engines: Box<[EngineFences]>,
    policy: WaitPolicy,
}

impl FenceTracker {
    /// Creates a tracker for `engine_count` engines, all fences at zero.
    #[must_use]
    pub fn new(engine_count: usize, policy: WaitPolicy) -> Self {
        let engines = (0..engine_count).map(|_| EngineFences::default()).collect();
        Self { engines, policy }
    }

    /// Number of engines tracked.
    #[inline]
    #[must_use]
    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    /// Iterates all engine ids.
    pub fn engines(&self) -> impl Iterator<Item = EngineId> {
        (0..self.engines.len()).map(|i| EngineId(i as u32))
    }

    /// Default wait policy.
    #[must_use]
    pub const fn policy(&self) -> &WaitPolicy {
        &self.policy
    }

    /// Checks that `engine` exists.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEngine` otherwise.
    pub fn check_engine(&self, engine: EngineId) -> DriverResult<()> {
        if engine.index() < self.engines.len() {
            Ok(())
        } else {
            Err(DriverError::UnknownEngine(engine))
        }
    }

    /// # Panics
    ///
    /// Panics if `engine` is out of range. Public entry points validate
    /// engines with [`check_engine`](Self::check_engine) first.
    fn slot(&self, engine: EngineId) -> &EngineFences {
        &self.engines[engine.index()]
    }

    /// Completion tag the device writes for `engine`.
    #[must_use]
    pub fn tag(&self, engine: EngineId) -> Arc<FenceTag> {
        Arc::clone(&self.slot(engine).tag)
    }

    /// Last fence handed out on `engine`.
    #[inline]
    #[must_use]
    pub fn current_fence(&self, engine: EngineId) -> FenceValue {
        self.slot(engine).current.load(Ordering::Acquire)
    }

    /// Last fence the device retired on `engine`.
    #[inline]
    #[must_use]
    pub fn retired_fence(&self, engine: EngineId) -> FenceValue {
        self.slot(engine).tag.retired()
    }

    /// Last fence queued on `engine`.
    #[inline]
    #[must_use]
    pub fn last_submitted_fence(&self, engine: EngineId) -> FenceValue {
        self.slot(engine).last_submitted.load(Ordering::Acquire)
    }

    /// Reserves the fence the next submission on `engine` will signal.
    pub fn next_fence(&self, engine: EngineId) -> FenceValue {
        self.slot(engine).current.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Records that work signalling `fence` is queued on `engine`.
    pub fn mark_submitted(&self, engine: EngineId, fence: FenceValue) {
        let slot = self.slot(engine);
        slot.current.fetch_max(fence, Ordering::AcqRel);
        slot.last_submitted.fetch_max(fence, Ordering::AcqRel);
    }

    /// Stamps `allocation` (and its fragments) as used by `engine` up to
    /// `fence`.
    pub fn stamp_future(&self, allocation: &Allocation, engine: EngineId, fence: FenceValue) {
        allocation.stamp_fence(engine, fence);
    }

    /// True if `fence` has retired on `engine`. Never-used counts as retired.
    #[inline]
    #[must_use]
    pub fn is_fence_retired(&self, engine: EngineId, fence: FenceValue) -> bool {
        fence == FENCE_NEVER_USED || fence <= self.retired_fence(engine)
    }

    /// True if every use of `allocation` on `engine` has retired.
    #[inline]
    #[must_use]
    pub fn is_retired(&self, allocation: &Allocation, engine: EngineId) -> bool {
        self.is_fence_retired(engine, allocation.last_fence(engine))
    }

    /// True if `allocation` is retired on every engine.
    #[must_use]
    pub fn is_idle(&self, allocation: &Allocation) -> bool {
        self.engines().all(|engine| self.is_retired(allocation, engine))
    }

    /// True if `engine` reported a device fault.
    #[must_use]
    pub fn is_device_lost(&self, engine: EngineId) -> bool {
        self.slot(engine).tag.is_lost()
    }

    /// First engine that reported a device fault, if any.
    #[must_use]
    pub fn lost_engine(&self) -> Option<EngineId> {
        self.engines().find(|&engine| self.is_device_lost(engine))
    }

    /// Blocks until `target` retires on `engine`, using the default policy.
    ///
    /// # Errors
    ///
    /// `DeviceLost`, `Timeout` or `UnknownEngine`.
    pub fn wait(&self, engine: EngineId, target: FenceValue) -> DriverResult<()> {
        self.wait_with(engine, target, &self.policy, None)
    }

    /// Blocks until everything handed out on `engine` has retired.
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait).
    pub fn wait_for_idle(&self, engine: EngineId) -> DriverResult<()> {
        self.wait(engine, self.current_fence(engine))
    }

    /// Blocks until `target` retires on `engine`.
    ///
    /// # Arguments
    ///
    /// * `policy` - Poll cadence and timeout
    /// * `cancel` - Optional token that abandons the wait
    ///
    /// # Errors
    ///
    /// `DeviceLost` if the engine faulted before `target` retired,
    /// `Timeout` when the policy's timeout elapses, `Cancelled` when the
    /// token fires, `UnknownEngine` for a bad engine id.
    pub fn wait_with(
        &self,
        engine: EngineId,
        target: FenceValue,
        policy: &WaitPolicy,
        cancel: Option<&CancelToken>,
    ) -> DriverResult<()> {
        self.check_engine(engine)?;
        if target == FENCE_NEVER_USED {
            return Ok(());
        }

        let tag = &self.slot(engine).tag;
        let start = Instant::now();
        let mut backoff = policy.poll_interval;
        let mut spins = 0u32;

        loop {
            let retired = tag.retired();
            if retired >= target {
                return Ok(());
            }
            if tag.is_lost() {
                tracing::error!("device lost while waiting for fence {} on {}", target, engine);
                return Err(DriverError::DeviceLost { engine });
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(DriverError::Cancelled { engine, target });
            }
            if let Some(timeout) = policy.timeout {
                if start.elapsed() >= timeout {
                    return Err(DriverError::Timeout { engine, target, retired });
                }
            }

            if spins < policy.spin_iterations {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }

            thread::sleep(backoff);
            backoff = (backoff * 2).min(policy.max_backoff).max(policy.poll_interval);
        }
    }
}
