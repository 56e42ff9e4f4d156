//! Schedulers
//!
//! Each protocol endpoint has exactly one scheduler. Every inbound message and
//! every local mutation of a bound entity runs on it, so the entity tree of an
//! endpoint has a single logical writer.
//!
//! # Implementations
//!
//! - [`ThreadScheduler`]: a dedicated worker thread draining a FIFO queue.
//! - [`ManualScheduler`]: a FIFO queue drained explicitly by the caller with
//!   [`pump`](ManualScheduler::pump). Deterministic, used by tests and by hosts
//!   that already own an event loop. Only one thread drives it at a time; a
//!   second thread that pumps or flushes waits for the first to finish.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::SchedulerError;

/// A unit of work queued on a scheduler.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Single-writer execution context of a protocol endpoint.
pub trait Scheduler: Send + Sync {
    /// Enqueue `action` to run after everything already queued.
    fn queue(&self, action: Action);

    /// `true` while the calling thread is executing inside this scheduler.
    fn is_active(&self) -> bool;

    /// Block until the queue is drained.
    ///
    /// Calling it from inside a queued action is an error, it would wait for
    /// itself.
    fn flush(&self) -> Result<(), SchedulerError>;

    /// Run one queued action on the calling thread, if this scheduler can be
    /// driven from outside. Returns `false` when nothing ran.
    ///
    /// Blocking waits use it so that a caller which owns the event loop keeps
    /// the loop turning while it waits.
    fn try_run_queued(&self) -> bool {
        false
    }
}

impl dyn Scheduler {
    /// Run `action` now if already on the scheduler, otherwise queue it.
    pub fn invoke_or_queue(&self, action: impl FnOnce() + Send + 'static) {
        if self.is_active() {
            action();
        } else {
            self.queue(Box::new(action));
        }
    }
}

fn run_action(scheduler: &str, action: Action) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(scheduler, %message, "queued action panicked");
    }
}

// ----------------------------------------------------------------------------
// ThreadScheduler
// ----------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    actions: VecDeque<Action>,
    running: bool,
    stopped: bool,
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    work: Condvar,
    idle: Condvar,
}

/// Scheduler backed by one dedicated worker thread.
pub struct ThreadScheduler {
    shared: Arc<Shared>,
    worker_id: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScheduler {
    /// Spawn the worker thread. `name` is used for the thread and in logs.
    pub fn new(name: impl Into<String>) -> Result<Self, SchedulerError> {
        let shared = Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            work: Condvar::new(),
            idle: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || Self::run(&worker_shared))
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;

        debug!(scheduler = %shared.name, "scheduler started");
        Ok(Self { worker_id: handle.thread().id(), shared, worker: Mutex::new(Some(handle)) })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn run(shared: &Shared) {
        loop {
            let action = {
                let mut state = shared.state.lock();
                loop {
                    if let Some(action) = state.actions.pop_front() {
                        state.running = true;
                        break action;
                    }
                    if state.stopped {
                        shared.idle.notify_all();
                        return;
                    }
                    shared.idle.notify_all();
                    shared.work.wait(&mut state);
                }
            };

            run_action(&shared.name, action);

            let mut state = shared.state.lock();
            state.running = false;
            if state.actions.is_empty() {
                shared.idle.notify_all();
            }
        }
    }

    /// Stop accepting work, drain what is queued and join the worker.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
        }
        self.shared.work.notify_all();

        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(scheduler = %self.shared.name, "scheduler thread panicked");
            }
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn queue(&self, action: Action) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            warn!(scheduler = %self.shared.name, "action queued on stopped scheduler dropped");
            return;
        }
        state.actions.push_back(action);
        drop(state);
        self.shared.work.notify_one();
    }

    fn is_active(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    fn flush(&self) -> Result<(), SchedulerError> {
        if self.is_active() {
            return Err(SchedulerError::FlushFromQueuedAction);
        }

        let mut state = self.shared.state.lock();
        if state.stopped && state.actions.is_empty() && !state.running {
            return Err(SchedulerError::Stopped);
        }
        while !state.actions.is_empty() || state.running {
            self.shared.idle.wait(&mut state);
        }
        Ok(())
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// ManualScheduler
// ----------------------------------------------------------------------------

/// Scheduler drained explicitly on the caller's thread.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use rdsync_core::protocol::{ManualScheduler, Scheduler};
///
/// let scheduler = Arc::new(ManualScheduler::new());
/// scheduler.queue(Box::new(|| println!("queued")));
/// assert_eq!(scheduler.pump(), 1);
/// ```
#[derive(Default)]
pub struct ManualScheduler {
    actions: Mutex<VecDeque<Action>>,
    activity: Mutex<Activity>,
    released: Condvar,
}

#[derive(Default)]
struct Activity {
    owner: Option<ThreadId>,
    depth: usize,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued actions.
    pub fn pending(&self) -> usize {
        self.actions.lock().len()
    }

    /// Execute queued actions, including ones queued while pumping, until
    /// the queue is empty. Returns how many actions ran.
    pub fn pump(&self) -> usize {
        let _active = self.activate();
        let mut executed = 0;
        loop {
            let next = self.actions.lock().pop_front();
            match next {
                Some(action) => {
                    run_action("manual", action);
                    executed += 1;
                }
                None => return executed,
            }
        }
    }

    /// Run `f` as if it were a queued action, then drain the queue.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let result = {
            let _active = self.activate();
            f()
        };
        self.pump();
        result
    }

    /// Make the calling thread the driver, waiting for another driver to
    /// finish first. Reentrant on the same thread.
    fn activate(&self) -> ActiveGuard<'_> {
        let me = thread::current().id();
        let mut activity = self.activity.lock();
        while matches!(activity.owner, Some(owner) if owner != me) {
            self.released.wait(&mut activity);
        }
        activity.owner = Some(me);
        activity.depth += 1;
        ActiveGuard { scheduler: self }
    }

    fn try_activate(&self) -> Option<ActiveGuard<'_>> {
        let mut activity = self.activity.lock();
        if activity.owner.is_some() {
            return None;
        }
        activity.owner = Some(thread::current().id());
        activity.depth = 1;
        Some(ActiveGuard { scheduler: self })
    }
}

struct ActiveGuard<'a> {
    scheduler: &'a ManualScheduler,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut activity = self.scheduler.activity.lock();
        activity.depth -= 1;
        if activity.depth == 0 {
            activity.owner = None;
            drop(activity);
            self.scheduler.released.notify_all();
        }
    }
}

impl Scheduler for ManualScheduler {
    fn queue(&self, action: Action) {
        self.actions.lock().push_back(action);
    }

    fn is_active(&self) -> bool {
        self.activity.lock().owner == Some(thread::current().id())
    }

    fn flush(&self) -> Result<(), SchedulerError> {
        if self.is_active() {
            return Err(SchedulerError::FlushFromQueuedAction);
        }
        self.pump();
        Ok(())
    }

    fn try_run_queued(&self) -> bool {
        let Some(_active) = self.try_activate() else {
            return false;
        };
        let next = self.actions.lock().pop_front();
        match next {
            Some(action) => {
                run_action("manual", action);
                true
            }
            None => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
