//! # Deferred Deleter
//!
//! Frees memory the device may still be reading, once it is done.
//!
//! ## Architecture
//!
//! ```text
//!   release() ──┐
//!   release() ──┼──> [FIFO queue] ──> [Deleter worker] ──> backend.release()
//!   release() ──┘     (mutex)          polls fences,
//!                                      requeues pending items
//! ```
//!
//! The worker is reference-counted by clients. It is spawned lazily by the
//! first `add_client` and exits only once the last client is gone AND the
//! queue is empty. A later client spawns a fresh worker.
//!
//! Items are applied with the queue lock released, so the worker never
//! blocks a foreground `defer_deletion` while it polls fences.
//!
//! Dropping the deleter keeps polling what is still queued until it is
//! freed or the shutdown grace period runs out.

use crate::error::{DriverError, DriverResult};
use gfxmem_shared::EngineId;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default time a dropped deleter keeps polling unfinished deletions.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// What happened when a deletion was attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// Memory released.
    Freed,
    /// Still in use by the device; try again later.
    Pending,
    /// The device faulted. Memory was released since nothing can touch it.
    DeviceLost(EngineId),
}

/// A deletion that must wait for asynchronous completion.
pub trait DeferrableDeletion: Send {
    /// Frees the resource if its fences have retired.
    fn apply(&mut self) -> DeletionOutcome;
}

/// Worker thread state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleterLifecycle {
    /// No worker thread. Blocking drains run on the caller.
    Inactive,
    /// Worker running with at least one client.
    Running,
    /// No clients left; worker exits once the queue is empty.
    Stopping,
}

type Queue = VecDeque<Box<dyn DeferrableDeletion>>;

struct DeleterState {
    queue: Queue,
    in_progress: usize,
    clients: usize,
    lifecycle: DeleterLifecycle,
    /// Set on drop: deadline for the final drain.
    shutdown: Option<Instant>,
    device_lost: Option<EngineId>,
    completed: u64,
    worker: Option<JoinHandle<()>>,
}

struct DeleterShared {
    state: Mutex<DeleterState>,
    /// New work or a lifecycle change.
    work: Condvar,
    /// A batch finished.
    idle: Condvar,
    poll_interval: Duration,
    shutdown_grace: Duration,
}

/// Background worker draining deferred deletions.
pub struct DeferredDeleter {
    shared: Arc<DeleterShared>,
}

impl std::fmt::Debug for DeferredDeleter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DeferredDeleter")
            .field("queued", &state.queue.len())
            .field("clients", &state.clients)
            .field("lifecycle", &state.lifecycle)
            .finish()
    }
}

impl DeferredDeleter {
    /// Creates an inactive deleter polling pending items every
    /// `poll_interval`.
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_shutdown_grace(poll_interval, DEFAULT_SHUTDOWN_GRACE)
    }

    /// Like [`new`](Self::new), but a dropped deleter gives unfinished
    /// deletions `shutdown_grace` to retire before leaking them.
    #[must_use]
    pub fn with_shutdown_grace(poll_interval: Duration, shutdown_grace: Duration) -> Self {
        Self {
            shared: Arc::new(DeleterShared {
                state: Mutex::new(DeleterState {
                    queue: VecDeque::new(),
                    in_progress: 0,
                    clients: 0,
                    lifecycle: DeleterLifecycle::Inactive,
                    shutdown: None,
                    device_lost: None,
                    completed: 0,
                    worker: None,
                }),
                work: Condvar::new(),
                idle: Condvar::new(),
                poll_interval: poll_interval.max(Duration::from_micros(1)),
                shutdown_grace,
            }),
        }
    }

    /// Queues `item` and wakes the worker.
    pub fn defer_deletion(&self, item: Box<dyn DeferrableDeletion>) {
        let mut state = self.shared.state.lock();
        state.queue.push_back(item);
        self.shared.work.notify_one();
    }

    /// Registers a user, spawning the worker if none is running.
    ///
    /// # Errors
    ///
    /// `Backend` if the OS refuses to spawn the thread. The deleter stays
    /// usable: blocking drains then run on the caller.
    pub fn add_client(&self) -> DriverResult<()> {
        let previous = {
            let mut state = self.shared.state.lock();
            state.clients += 1;
            match state.lifecycle {
                DeleterLifecycle::Running => return Ok(()),
                DeleterLifecycle::Stopping => {
                    state.lifecycle = DeleterLifecycle::Running;
                    return Ok(());
                }
                DeleterLifecycle::Inactive => {}
            }

            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name("gfxmem-deleter".to_string())
                .spawn(move || Self::worker_loop(&shared))
                .map_err(|e| DriverError::Backend(format!("Failed to spawn deleter: {e}")))?;

            state.lifecycle = DeleterLifecycle::Running;
            tracing::debug!("deferred deleter worker started");
            state.worker.replace(handle)
        };

        if let Some(handle) = previous {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Unregisters a user. The worker winds down after the last one.
    pub fn remove_client(&self) {
        let mut state = self.shared.state.lock();
        state.clients = state.clients.saturating_sub(1);
        if state.clients == 0 && state.lifecycle == DeleterLifecycle::Running {
            state.lifecycle = DeleterLifecycle::Stopping;
        }
        self.shared.work.notify_all();
    }

    /// Processes the queue.
    ///
    /// Non-blocking: wakes the worker and returns. Blocking: returns once
    /// the queue is observably empty and no batch is in flight. Without a
    /// worker the caller's thread does the work.
    ///
    /// # Errors
    ///
    /// `DeviceLost` if any drained item observed a device fault since the
    /// last drain.
    pub fn drain(&self, blocking: bool) -> DriverResult<()> {
        if !blocking {
            self.shared.work.notify_all();
            return Ok(());
        }

        let mut state = self.shared.state.lock();
        while !(state.queue.is_empty() && state.in_progress == 0) {
            if state.lifecycle == DeleterLifecycle::Inactive && !state.queue.is_empty() {
                Self::process_batch(&self.shared, &mut state);
                if !state.queue.is_empty() {
                    let poll = self.shared.poll_interval;
                    MutexGuard::unlocked(&mut state, || thread::sleep(poll));
                }
                continue;
            }
            self.shared.work.notify_all();
            self.shared.idle.wait_for(&mut state, self.shared.poll_interval);
        }

        match state.device_lost.take() {
            Some(engine) => Err(DriverError::DeviceLost { engine }),
            None => Ok(()),
        }
    }

    /// Applies the whole queue once with the lock released; requeues what
    /// is still pending at the front, in order.
    fn process_batch(shared: &DeleterShared, state: &mut MutexGuard<'_, DeleterState>) {
        let batch: Vec<_> = state.queue.drain(..).collect();
        let batch_len = batch.len();
        // Concurrent inline drains may each have a batch in flight.
        state.in_progress += batch_len;

        let (pending, freed, lost) = MutexGuard::unlocked(state, || {
            let mut pending = Vec::new();
            let mut freed = 0u64;
            let mut lost = None;
            for mut item in batch {
                match item.apply() {
                    DeletionOutcome::Freed => freed += 1,
                    DeletionOutcome::Pending => pending.push(item),
                    DeletionOutcome::DeviceLost(engine) => {
                        freed += 1;
                        lost = Some(engine);
                    }
                }
            }
            (pending, freed, lost)
        });

        state.in_progress -= batch_len;
        for item in pending.into_iter().rev() {
            state.queue.push_front(item);
        }
        state.completed += freed;
        if let Some(engine) = lost {
            tracing::error!("deferred deletion observed device lost on {}", engine);
            state.device_lost = Some(engine);
        }
        shared.idle.notify_all();
    }

    fn worker_loop(shared: &DeleterShared) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown.is_some() {
                Self::drain_for_shutdown(shared, &mut state);
                break;
            }
            if state.queue.is_empty() {
                if state.in_progress == 0 && state.clients == 0 {
                    break;
                }
                if state.in_progress > 0 {
                    shared.work.wait_for(&mut state, shared.poll_interval);
                } else {
                    shared.work.wait(&mut state);
                }
                continue;
            }

            Self::process_batch(shared, &mut state);

            if !state.queue.is_empty() {
                shared.work.wait_for(&mut state, shared.poll_interval);
            }
        }

        state.lifecycle = DeleterLifecycle::Inactive;
        shared.idle.notify_all();
        tracing::debug!("deferred deleter worker stopped");
    }

    /// Applies the queue until it empties or the shutdown deadline passes.
    /// Whatever is left then is leaked.
    fn drain_for_shutdown(shared: &DeleterShared, state: &mut MutexGuard<'_, DeleterState>) {
        let Some(deadline) = state.shutdown else {
            return;
        };
        while !state.queue.is_empty() {
            Self::process_batch(shared, state);
            if state.queue.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::error!("leaking {} deferred deletions still in flight at shutdown", state.queue.len());
                state.queue.clear();
                break;
            }
            let poll = shared.poll_interval;
            MutexGuard::unlocked(state, || thread::sleep(poll));
        }
    }

    /// Current worker state.
    #[must_use]
    pub fn lifecycle(&self) -> DeleterLifecycle {
        self.shared.state.lock().lifecycle
    }

    /// Items waiting in the queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.queue.len() + state.in_progress
    }

    /// Registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.state.lock().clients
    }

    /// Deletions completed so far.
    #[must_use]
    pub fn completed_count(&self) -> u64 {
        self.shared.state.lock().completed
    }
}

impl Drop for DeferredDeleter {
    fn drop(&mut self) {
        let handle = {
            let mut state = self.shared.state.lock();
            state.shutdown = Some(Instant::now() + self.shared.shutdown_grace);
            state.clients = 0;
            self.shared.work.notify_all();
            state.worker.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        // Without a worker the queue is finished here.
        let mut state = self.shared.state.lock();
        Self::drain_for_shutdown(&self.shared, &mut state);
    }
}
