//! Lifetime Implementation
//!
//! A lifetime is a handle to a node in a cancellation tree. Cloning the handle
//! shares the node. Terminating a node terminates all of its nested lifetimes
//! first, newest to oldest, and then runs its own termination actions in
//! reverse attach order. Every action runs exactly once.
//!
//! # State
//!
//! The whole mutable state of a node that other threads race on is packed
//! into a single `AtomicU64`:
//!
//! - bits 0..2: status (`Alive`, `Terminating`, `Terminated`)
//! - bits 2..64: number of in-flight `execute_if_alive` calls
//!
//! Packing both into one word lets `execute_if_alive` check liveness and
//! register itself in one compare-and-swap, which closes the window between
//! "is it alive?" and "run the action" that a separate check would leave open.
//!
//! Resources (actions and children) live behind a mutex. `attach` checks the
//! status while holding that mutex and `terminate` drains the resources only
//! after flipping the status, so an action is either rejected or guaranteed to
//! run.
//!
//! # Parents
//!
//! A node usually has one parent. An intersection has two and is registered
//! as a child of both. Whichever node finishes terminating removes itself from
//! every parent it still has, so short-lived children never pile up in a
//! long-lived parent.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{trace, warn};

use super::context::ExecutionContext;
use crate::error::LifetimeError;

const STATUS_MASK: u64 = 0b11;
const EXECUTING_UNIT: u64 = 0b100;

const ALIVE: u64 = 0;
const TERMINATING: u64 = 1;
const TERMINATED: u64 = 2;

/// Counter for lifetime ids, used only for diagnostics and the execution context.
static NEXT_LIFETIME_ID: AtomicU64 = AtomicU64::new(1);

/// Default bound on how long termination waits for in-flight
/// `execute_if_alive` calls.
pub const DEFAULT_TERMINATION_WAIT: Duration = Duration::from_millis(500);

type Action = Box<dyn FnOnce() + Send>;

/// Observable state of a lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifetimeStatus {
    Alive,
    Terminating,
    Terminated,
}

#[derive(Default)]
struct Resources {
    children: SmallVec<[Arc<Inner>; 4]>,
    actions: SmallVec<[Action; 4]>,
}

type Parents = SmallVec<[Weak<Inner>; 2]>;

struct Inner {
    id: u64,
    eternal: bool,
    state: AtomicU64,
    parents: Parents,
    termination_wait_ms: AtomicU64,
    resources: Mutex<Resources>,
}

impl Inner {
    fn new(parents: Parents, eternal: bool, termination_wait_ms: u64) -> Self {
        Self {
            id: NEXT_LIFETIME_ID.fetch_add(1, Ordering::Relaxed),
            eternal,
            state: AtomicU64::new(ALIVE),
            parents,
            termination_wait_ms: AtomicU64::new(termination_wait_ms),
            resources: Mutex::new(Resources::default()),
        }
    }

    fn root() -> Self {
        Self::new(Parents::new(), false, DEFAULT_TERMINATION_WAIT.as_millis() as u64)
    }

    fn nested_in(parents: &[&Arc<Inner>]) -> Self {
        let wait = parents
            .iter()
            .map(|p| p.termination_wait_ms.load(Ordering::Relaxed))
            .max()
            .unwrap_or(DEFAULT_TERMINATION_WAIT.as_millis() as u64);
        Self::new(parents.iter().map(|p| Arc::downgrade(p)).collect(), false, wait)
    }

    /// Register `child` unless this node already stopped being alive.
    fn try_adopt(&self, child: &Arc<Inner>) -> bool {
        let mut resources = self.resources.lock();
        if self.status_bits() != ALIVE {
            return false;
        }
        resources.children.push(Arc::clone(child));
        true
    }

    fn status_bits(&self) -> u64 {
        self.state.load(Ordering::Acquire) & STATUS_MASK
    }

    fn try_attach(&self, action: Action) -> Result<(), Action> {
        let mut resources = self.resources.lock();
        if self.status_bits() != ALIVE {
            return Err(action);
        }
        resources.actions.push(action);
        Ok(())
    }

    fn terminate(self: &Arc<Self>, failures: &mut Vec<String>) {
        if self.eternal {
            return;
        }

        loop {
            let s = self.state.load(Ordering::Acquire);
            if s & STATUS_MASK != ALIVE {
                // someone else won the race and performs the teardown
                return;
            }
            let next = (s & !STATUS_MASK) | TERMINATING;
            if self
                .state
                .compare_exchange_weak(s, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        self.wait_for_executions();

        let resources = std::mem::take(&mut *self.resources.lock());

        for child in resources.children.into_iter().rev() {
            child.terminate(failures);
        }

        for action in resources.actions.into_iter().rev() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
                let message = panic_message(payload.as_ref());
                warn!(lifetime = self.id, %message, "termination action failed");
                failures.push(message);
            }
        }

        // Terminating (1) -> Terminated (2), executing count untouched
        self.state.fetch_add(TERMINATED - TERMINATING, Ordering::AcqRel);
        trace!(lifetime = self.id, "lifetime terminated");

        for parent in self.parents.iter().filter_map(Weak::upgrade) {
            parent.resources.lock().children.retain(|c| !Arc::ptr_eq(c, self));
        }
    }

    fn wait_for_executions(&self) {
        let own = ExecutionContext::depth_on_current_thread(self.id) as u64;
        let wait = Duration::from_millis(self.termination_wait_ms.load(Ordering::Relaxed));
        let deadline = Instant::now() + wait;

        loop {
            let executing = self.state.load(Ordering::Acquire) / EXECUTING_UNIT;
            if executing <= own {
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    lifetime = self.id,
                    executing,
                    "executeIfAlive still running after {} ms, terminating anyway",
                    wait.as_millis()
                );
                return;
            }
            std::thread::yield_now();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "termination action panicked".to_string()
    }
}

/// A hierarchical cancellation token with ordered, exactly-once cleanup.
///
/// # Example
///
/// ```rust
/// use rdsync_core::lifetime::Lifetime;
///
/// let root = Lifetime::new();
/// let nested = root.create_nested();
/// nested.attach(|| println!("nested cleanup")).unwrap();
/// root.attach(|| println!("root cleanup")).unwrap();
///
/// // prints "nested cleanup" then "root cleanup"
/// root.terminate().unwrap();
/// assert!(nested.is_terminated());
/// ```
#[derive(Clone)]
pub struct Lifetime {
    inner: Arc<Inner>,
}

impl Lifetime {
    /// Create a new root lifetime.
    ///
    /// Attached actions only run when the lifetime is terminated; dropping the
    /// last handle does not terminate it.
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner::root()) }
    }

    /// The lifetime that never terminates.
    pub fn eternal() -> Lifetime {
        static ETERNAL: OnceLock<Lifetime> = OnceLock::new();
        ETERNAL
            .get_or_init(|| Lifetime {
                inner: Arc::new(Inner::new(Parents::new(), true, DEFAULT_TERMINATION_WAIT.as_millis() as u64)),
            })
            .clone()
    }

    /// A shared lifetime that is already terminated.
    pub fn terminated() -> Lifetime {
        static TERMINATED_LIFETIME: OnceLock<Lifetime> = OnceLock::new();
        TERMINATED_LIFETIME
            .get_or_init(|| {
                let lifetime = Lifetime::new();
                let _ = lifetime.terminate();
                lifetime
            })
            .clone()
    }

    /// Change how long terminating this lifetime waits for in-flight
    /// guarded executions. Lifetimes nested afterwards inherit the value.
    /// Ignored on the eternal lifetime, which is shared.
    pub fn set_termination_wait(&self, wait: Duration) {
        if self.inner.eternal {
            return;
        }
        self.inner.termination_wait_ms.store(wait.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn termination_wait(&self) -> Duration {
        Duration::from_millis(self.inner.termination_wait_ms.load(Ordering::Relaxed))
    }

    /// Run `f` with a fresh lifetime that is terminated when `f` returns.
    pub fn using<R>(f: impl FnOnce(&Lifetime) -> R) -> R {
        let guard = TerminateOnDrop(Lifetime::new());
        f(&guard.0)
    }

    /// Run `f` with a nested lifetime that is terminated when `f` returns.
    pub fn using_nested<R>(&self, f: impl FnOnce(&Lifetime) -> R) -> R {
        let guard = TerminateOnDrop(self.create_nested());
        f(&guard.0)
    }

    /// A lifetime that terminates as soon as either `a` or `b` terminates.
    ///
    /// The result is nested in both, and leaves neither once it has
    /// terminated.
    pub fn intersect(a: &Lifetime, b: &Lifetime) -> Lifetime {
        let parents: SmallVec<[&Arc<Inner>; 2]> =
            [a, b].into_iter().filter(|p| !p.is_eternal()).map(|p| &p.inner).collect();
        let result = Lifetime { inner: Arc::new(Inner::nested_in(&parents)) };

        for parent in parents {
            if !parent.try_adopt(&result.inner) {
                let _ = result.terminate();
                break;
            }
        }
        result
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> LifetimeStatus {
        match self.inner.status_bits() {
            ALIVE => LifetimeStatus::Alive,
            TERMINATING => LifetimeStatus::Terminating,
            _ => LifetimeStatus::Terminated,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.inner.status_bits() == ALIVE
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.status_bits() == TERMINATED
    }

    pub fn is_eternal(&self) -> bool {
        self.inner.eternal
    }

    /// Create a child lifetime that terminates together with this one.
    ///
    /// If this lifetime is no longer alive the child is returned already
    /// terminated.
    pub fn create_nested(&self) -> Lifetime {
        let child = Lifetime { inner: Arc::new(Inner::nested_in(&[&self.inner])) };
        if self.inner.eternal || self.inner.try_adopt(&child.inner) {
            return child;
        }

        let _ = child.terminate();
        child
    }

    /// Record an action to run when this lifetime terminates.
    pub fn attach<F>(&self, action: F) -> Result<(), LifetimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.try_attach(Box::new(action)).map_err(|_| LifetimeError::Terminated)
    }

    /// Alias of [`attach`](Self::attach).
    pub fn on_termination<F>(&self, action: F) -> Result<(), LifetimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.attach(action)
    }

    /// Like [`attach`](Self::attach) but reports failure as `false`.
    pub fn on_termination_if_alive<F>(&self, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.attach(action).is_ok()
    }

    /// Keep `resource` alive until this lifetime terminates, then drop it.
    pub fn attach_resource<R>(&self, resource: R) -> Result<(), LifetimeError>
    where
        R: Send + 'static,
    {
        self.attach(move || drop(resource))
    }

    /// Run `action` only if the lifetime is alive.
    ///
    /// Termination that starts while `action` runs waits for it to finish
    /// before running cleanup.
    pub fn execute_if_alive<R>(&self, action: impl FnOnce() -> R) -> Option<R> {
        loop {
            let s = self.inner.state.load(Ordering::Acquire);
            if s & STATUS_MASK != ALIVE {
                return None;
            }
            if self
                .inner
                .state
                .compare_exchange_weak(s, s + EXECUTING_UNIT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let _execution = ExecutionGuard {
            inner: &self.inner,
            _context: ExecutionContext::enter(self.inner.id),
        };
        Some(action())
    }

    /// Run `opening` and register `termination` as one step, only if alive.
    ///
    /// If the lifetime starts terminating between the two, `termination` runs
    /// immediately and `None` is returned.
    pub fn bracket_if_alive<T, F>(&self, opening: impl FnOnce() -> T, termination: F) -> Option<T>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_if_alive(|| {
            let value = opening();
            match self.inner.try_attach(Box::new(termination)) {
                Ok(()) => Some(value),
                Err(termination) => {
                    termination();
                    None
                }
            }
        })
        .flatten()
    }

    /// Terminate this lifetime and everything nested in it.
    ///
    /// Idempotent and safe to call from several threads at once: exactly one
    /// caller performs the teardown, the others return immediately. Panicking
    /// actions do not stop their siblings; their messages are returned together.
    pub fn terminate(&self) -> Result<(), LifetimeError> {
        if self.inner.eternal {
            warn!("attempt to terminate the eternal lifetime ignored");
            return Ok(());
        }

        let mut failures = Vec::new();
        self.inner.terminate(&mut failures);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifetimeError::TerminationFailed { failures })
        }
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Lifetime {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Lifetime {}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("eternal", &self.inner.eternal)
            .finish()
    }
}

struct ExecutionGuard<'a> {
    inner: &'a Inner,
    _context: ExecutionContext,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.fetch_sub(EXECUTING_UNIT, Ordering::AcqRel);
    }
}

struct TerminateOnDrop(Lifetime);

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        if let Err(e) = self.0.terminate() {
            warn!(error = %e, "scoped lifetime teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI32};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |name: &'static str| {
            let log = Arc::clone(&log_clone);
            Box::new(move || log.lock().push(name)) as Box<dyn FnOnce() + Send>
        };
        (log, make)
    }

    #[test]
    fn actions_run_in_reverse_order() {
        let (log, make) = recorder();
        let lifetime = Lifetime::new();

        lifetime.attach(make("a1")).unwrap();
        lifetime.attach(make("a2")).unwrap();
        lifetime.attach(make("a3")).unwrap();

        lifetime.terminate().unwrap();
        assert_eq!(*log.lock(), vec!["a3", "a2", "a1"]);
    }

    #[test]
    fn nested_lifetimes_terminate_before_own_actions() {
        let (log, make) = recorder();
        let root = Lifetime::new();

        root.attach(make("root-1")).unwrap();
        let first = root.create_nested();
        first.attach(make("first")).unwrap();
        let second = root.create_nested();
        second.attach(make("second")).unwrap();
        root.attach(make("root-2")).unwrap();

        root.terminate().unwrap();

        assert_eq!(*log.lock(), vec!["second", "first", "root-2", "root-1"]);
        assert!(first.is_terminated());
        assert!(second.is_terminated());
    }

    #[test]
    fn terminate_is_idempotent() {
        let count = Arc::new(AtomicI32::new(0));
        let lifetime = Lifetime::new();
        let count_clone = count.clone();
        lifetime.attach(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        lifetime.terminate().unwrap();
        lifetime.terminate().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(lifetime.status(), LifetimeStatus::Terminated);
    }

    #[test]
    fn concurrent_terminate_runs_actions_once() {
        for _ in 0..50 {
            let count = Arc::new(AtomicI32::new(0));
            let lifetime = Lifetime::new();
            for _ in 0..10 {
                let count = count.clone();
                lifetime.attach(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let lifetime = lifetime.clone();
                    std::thread::spawn(move || lifetime.terminate())
                })
                .collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }

            assert_eq!(count.load(Ordering::SeqCst), 10);
        }
    }

    #[test]
    fn attach_after_termination_fails() {
        let lifetime = Lifetime::new();
        lifetime.terminate().unwrap();

        assert_eq!(lifetime.attach(|| {}), Err(LifetimeError::Terminated));
        assert!(!lifetime.on_termination_if_alive(|| {}));
    }

    #[test]
    fn nested_of_terminated_parent_is_pre_terminated() {
        let parent = Lifetime::new();
        parent.terminate().unwrap();

        let child = parent.create_nested();
        assert!(child.is_terminated());
    }

    #[test]
    fn failing_actions_are_aggregated() {
        let ran = Arc::new(AtomicBool::new(false));
        let lifetime = Lifetime::new();

        let ran_clone = ran.clone();
        lifetime.attach(move || ran_clone.store(true, Ordering::SeqCst)).unwrap();
        lifetime.attach(|| panic!("first failure")).unwrap();
        lifetime.attach(|| panic!("second failure")).unwrap();

        let err = lifetime.terminate().unwrap_err();

        assert!(ran.load(Ordering::SeqCst));
        match err {
            LifetimeError::TerminationFailed { failures } => {
                assert_eq!(failures, vec!["second failure".to_string(), "first failure".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn execute_if_alive_skips_terminated() {
        let lifetime = Lifetime::new();
        assert_eq!(lifetime.execute_if_alive(|| 5), Some(5));

        lifetime.terminate().unwrap();
        assert_eq!(lifetime.execute_if_alive(|| 5), None);
    }

    #[test]
    fn terminate_inside_own_execution_does_not_wait() {
        let lifetime = Lifetime::new();
        let start = Instant::now();

        lifetime.execute_if_alive(|| lifetime.terminate().unwrap());

        assert!(lifetime.is_terminated());
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn termination_waits_for_execution_on_other_thread() {
        let lifetime = Lifetime::new();
        let finished = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = std::sync::mpsc::channel();

        let worker = {
            let lifetime = lifetime.clone();
            let finished = finished.clone();
            std::thread::spawn(move || {
                lifetime.execute_if_alive(|| {
                    started_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(50));
                    finished.store(true, Ordering::SeqCst);
                });
            })
        };

        started_rx.recv().unwrap();
        let observed = finished.clone();
        lifetime.attach(move || assert!(observed.load(Ordering::SeqCst))).unwrap();
        lifetime.terminate().unwrap();

        worker.join().unwrap();
    }

    #[test]
    fn bracket_runs_termination_on_teardown() {
        let (log, make) = recorder();
        let lifetime = Lifetime::new();

        let opened = lifetime.bracket_if_alive(|| 7, make("closed"));
        assert_eq!(opened, Some(7));
        assert!(log.lock().is_empty());

        lifetime.terminate().unwrap();
        assert_eq!(*log.lock(), vec!["closed"]);

        assert_eq!(lifetime.bracket_if_alive(|| 8, make("never")), None);
        assert_eq!(*log.lock(), vec!["closed"]);
    }

    #[test]
    fn eternal_never_terminates() {
        let eternal = Lifetime::eternal();
        eternal.terminate().unwrap();

        assert!(eternal.is_alive());
        assert!(eternal.is_eternal());
        assert_eq!(eternal, Lifetime::eternal());
    }

    #[test]
    fn intersection_terminates_with_either_parent() {
        let a = Lifetime::new();
        let b = Lifetime::new();
        let both = Lifetime::intersect(&a, &b);

        assert!(both.is_alive());
        b.terminate().unwrap();
        assert!(both.is_terminated());
        assert!(a.is_alive());
    }

    #[test]
    fn finished_intersections_leave_nothing_behind() {
        let a = Lifetime::new();
        let b = Lifetime::new();
        for _ in 0..1000 {
            Lifetime::intersect(&a, &b).terminate().unwrap();
        }

        for parent in [&a, &b] {
            let resources = parent.inner.resources.lock();
            assert!(resources.children.is_empty());
            assert!(resources.actions.is_empty());
        }
    }

    #[test]
    fn intersection_with_terminated_parent_is_terminated() {
        let alive = Lifetime::new();
        let dead = Lifetime::new();
        dead.terminate().unwrap();

        let both = Lifetime::intersect(&alive, &dead);
        assert!(both.is_terminated());
        assert!(alive.inner.resources.lock().children.is_empty());

        let with_eternal = Lifetime::intersect(&Lifetime::eternal(), &alive);
        alive.terminate().unwrap();
        assert!(with_eternal.is_terminated());
    }

    #[test]
    fn termination_wait_is_per_lifetime_and_inherited() {
        let patient = Lifetime::new();
        let hasty = Lifetime::new();
        hasty.set_termination_wait(Duration::from_millis(20));

        assert_eq!(patient.termination_wait(), DEFAULT_TERMINATION_WAIT);
        assert_eq!(hasty.create_nested().termination_wait(), Duration::from_millis(20));
        assert_eq!(Lifetime::intersect(&patient, &hasty).termination_wait(), DEFAULT_TERMINATION_WAIT);

        Lifetime::eternal().set_termination_wait(Duration::ZERO);
        assert_eq!(Lifetime::eternal().termination_wait(), DEFAULT_TERMINATION_WAIT);
    }

    #[test]
    fn short_termination_wait_gives_up_on_slow_execution() {
        let lifetime = Lifetime::new();
        lifetime.set_termination_wait(Duration::from_millis(20));
        let (started_tx, started_rx) = std::sync::mpsc::channel();

        let worker = {
            let lifetime = lifetime.clone();
            std::thread::spawn(move || {
                lifetime.execute_if_alive(|| {
                    started_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(400));
                });
            })
        };

        started_rx.recv().unwrap();
        let start = Instant::now();
        lifetime.terminate().unwrap();
        assert!(start.elapsed() < Duration::from_millis(300));

        worker.join().unwrap();
    }

    #[test]
    fn terminated_child_detaches_from_parent() {
        let parent = Lifetime::new();
        for _ in 0..100 {
            parent.create_nested().terminate().unwrap();
        }
        assert!(parent.inner.resources.lock().children.is_empty());
    }

    #[test]
    fn using_terminates_scope() {
        let captured = Lifetime::using(|lifetime| lifetime.clone());
        assert!(captured.is_terminated());
    }
}
