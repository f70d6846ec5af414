//! # Device Abstraction
//!
//! The engine-facing side of the core: something that accepts command
//! buffers with their residency list and eventually writes completion
//! fences to the CPU-visible tags of a [`FenceTracker`].
//!
//! [`SimulatedDevice`] retires work either on demand (`Manual`) or from a
//! background "GPU" thread fed by a channel (`Background`).

use crate::error::{DriverError, DriverResult};
use crate::memory::Allocation;
use crate::sync::{FenceTag, FenceTracker};
use crossbeam_channel::{unbounded, Sender};
use gfxmem_shared::{EngineId, FenceValue};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One unit of work handed to an engine.
#[derive(Debug)]
pub struct Submission<'a> {
    /// Target engine.
    pub engine: EngineId,
    /// Fence the engine signals when the work retires.
    pub fence: FenceValue,
    /// Encoded commands. Opaque to the core.
    pub command_buffer: &'a [u8],
    /// Allocations the work references; all resident.
    pub residency: &'a [Arc<Allocation>],
}

/// Engine access consumed by the memory manager.
pub trait Device: Send + Sync + std::fmt::Debug {
    /// Fence tracker whose tags this device writes.
    fn fences(&self) -> Arc<FenceTracker>;

    /// Queues `submission`; returns the fence it will signal.
    ///
    /// # Errors
    ///
    /// `DeviceLost` once the device has faulted.
    fn submit(&self, submission: &Submission<'_>) -> DriverResult<FenceValue>;
}

/// How a simulated device retires work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionMode {
    /// Nothing retires until [`SimulatedDevice::retire`] is called.
    Manual,
    /// A background thread retires each submission after `latency`.
    Background {
        /// Simulated execution time per submission.
        latency: Duration,
    },
}

/// Record of a submission seen by the simulated device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionRecord {
    /// Target engine.
    pub engine: EngineId,
    /// Fence to be signalled.
    pub fence: FenceValue,
    /// Command buffer length.
    pub command_bytes: usize,
    /// Number of allocations referenced.
    pub residency_count: usize,
}

/// Device stand-in driving fence tags from host code.
pub struct SimulatedDevice {
    fences: Arc<FenceTracker>,
    mode: CompletionMode,
    queue: Option<Sender<(EngineId, FenceValue)>>,
    gpu_thread: Option<JoinHandle<()>>,
    submissions: Mutex<Vec<SubmissionRecord>>,
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("mode", &self.mode)
            .field("engines", &self.fences.engine_count())
            .finish_non_exhaustive()
    }
}

impl SimulatedDevice {
    /// Creates a device retiring work only when told to.
    #[must_use]
    pub fn manual(fences: Arc<FenceTracker>) -> Self {
        Self {
            fences,
            mode: CompletionMode::Manual,
            queue: None,
            gpu_thread: None,
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Creates a device retiring each submission in order after `latency`.
    ///
    /// # Errors
    ///
    /// `Backend` if the GPU thread cannot be spawned.
    pub fn background(fences: Arc<FenceTracker>, latency: Duration) -> DriverResult<Self> {
        let (sender, receiver) = unbounded::<(EngineId, FenceValue)>();
        let tags: Vec<Arc<FenceTag>> = fences.engines().map(|engine| fences.tag(engine)).collect();

        let gpu_thread = thread::Builder::new()
            .name("gfxmem-sim-gpu".to_string())
            .spawn(move || {
                for (engine, fence) in receiver {
                    if !latency.is_zero() {
                        thread::sleep(latency);
                    }
                    tags[engine.index()].signal(fence);
                }
            })
            .map_err(|e| DriverError::Backend(format!("Failed to spawn simulated GPU: {e}")))?;

        Ok(Self {
            fences,
            mode: CompletionMode::Background { latency },
            queue: Some(sender),
            gpu_thread: Some(gpu_thread),
            submissions: Mutex::new(Vec::new()),
        })
    }

    /// Completion mode.
    #[must_use]
    pub const fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// Retires `engine` up to `fence`.
    pub fn retire(&self, engine: EngineId, fence: FenceValue) {
        self.fences.tag(engine).signal(fence);
    }

    /// Retires everything handed out on every engine.
    pub fn retire_all(&self) {
        for engine in self.fences.engines() {
            self.retire(engine, self.fences.current_fence(engine));
        }
    }

    /// Simulates an unrecoverable fault on `engine`.
    pub fn lose_device(&self, engine: EngineId) {
        tracing::error!("simulated device lost on {}", engine);
        self.fences.tag(engine).mark_lost();
    }

    /// Submissions seen so far.
    #[must_use]
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.submissions.lock().clone()
    }
}

impl Device for SimulatedDevice {
    fn fences(&self) -> Arc<FenceTracker> {
        Arc::clone(&self.fences)
    }

    fn submit(&self, submission: &Submission<'_>) -> DriverResult<FenceValue> {
        if let Some(engine) = self.fences.lost_engine() {
            return Err(DriverError::DeviceLost { engine });
        }

        self.submissions.lock().push(SubmissionRecord {
            engine: submission.engine,
            fence: submission.fence,
            command_bytes: submission.command_buffer.len(),
            residency_count: submission.residency.len(),
        });

        if let Some(queue) = &self.queue {
            queue
                .send((submission.engine, submission.fence))
                .map_err(|_| DriverError::DeviceLost { engine: submission.engine })?;
        }
        Ok(submission.fence)
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        // Closing the channel ends the GPU thread after it drains.
        self.queue.take();
        if let Some(handle) = self.gpu_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::WaitPolicy;

    fn submission(engine: EngineId, fence: FenceValue) -> Submission<'static> {
        Submission { engine, fence, command_buffer: &[0u8; 16], residency: &[] }
    }

    #[test]
    fn test_manual_device_retires_on_demand() {
        let fences = Arc::new(FenceTracker::new(2, WaitPolicy::default()));
        let device = SimulatedDevice::manual(Arc::clone(&fences));
        let e = EngineId(1);

        let fence = fences.next_fence(e);
        assert_eq!(device.submit(&submission(e, fence)).unwrap(), fence);
        assert_eq!(fences.retired_fence(e), 0);

        device.retire_all();
        assert_eq!(fences.retired_fence(e), fence);
        assert_eq!(device.submissions()[0].command_bytes, 16);
    }

    #[test]
    fn test_background_device_retires_in_order() {
        let fences = Arc::new(FenceTracker::new(1, WaitPolicy::default()));
        let device = SimulatedDevice::background(Arc::clone(&fences), Duration::from_micros(200)).unwrap();
        let e = EngineId(0);

        let mut last = 0;
        for _ in 0..5 {
            last = fences.next_fence(e);
            device.submit(&submission(e, last)).unwrap();
        }

        fences.wait(e, last).unwrap();
        assert_eq!(fences.retired_fence(e), last);
    }

    #[test]
    fn test_lost_device_rejects_submissions() {
        let fences = Arc::new(FenceTracker::new(1, WaitPolicy::default()));
        let device = SimulatedDevice::manual(Arc::clone(&fences));
        device.lose_device(EngineId(0));

        let err = device.submit(&submission(EngineId(0), 1)).unwrap_err();
        assert!(err.is_fatal());
    }
}
