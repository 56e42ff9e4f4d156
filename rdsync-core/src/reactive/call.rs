//! Remote Calls
//!
//! [`RdCall`] is a request/response endpoint bound at the same position on
//! both sides. Either side may start a call; the other side runs its handler.
//!
//! # How It Works
//!
//! 1. `start` allocates a fresh task id with [`Identities::next`], subscribes
//!    for the response on that id and sends `[task id][request]` on the call's
//!    own id.
//!
//! 2. The responder runs its handler under a lifetime nested in the call's
//!    bind lifetime and listens on the task id for cancellation.
//!
//! 3. When the handler's task completes, the responder sends
//!    `[i32 kind][payload]` on the task id:
//!
//! ```text
//!   0  Success    [value]
//!   1  Cancelled
//!   2  Fault      [type name][message][text]
//! ```
//!
//! 4. Cancelling on the requester (explicitly or by ending the lifetime the
//!    call was started under) resolves the task as `Cancelled` and sends an
//!    empty frame on the task id. The responder terminates the handler
//!    lifetime when it sees it and drops the late result.
//!
//! Handler failures travel as data ([`RdTaskResult::Fault`]); a panicking
//! handler produces a fault too.
//!
//! # Blocking
//!
//! [`RdTask::wait`] and [`RdCall::sync`] block the calling thread, which must
//! not be the scheduler's own. If the scheduler can be driven from outside
//! (a [`ManualScheduler`](crate::protocol::ManualScheduler) nobody else is
//! pumping), the waiting thread runs its queued work, so the response is
//! still delivered.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::config::RpcTimeouts;
use crate::error::{BufferError, ProtocolError, TaskError};
use crate::lifetime::Lifetime;
use crate::protocol::{Buffer, Identities, Marshaller, Protocol, RdId, Scheduler, SerializationCtx, WireHandler};

use super::entity::{BindCore, RdBindable, RdDynamic};
use super::RdValue;

// ============================================================================
// Results
// ============================================================================

/// A failure reported by the remote handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdFault {
    pub type_name: String,
    pub message: String,
    pub text: String,
}

impl RdFault {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        let type_name = type_name.into();
        let message = message.into();
        let text = format!("{type_name}: {message}");
        Self { type_name, message, text }
    }

    /// Fault describing a caught panic.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new("Panic", message)
    }
}

impl fmt::Display for RdFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl Marshaller for RdFault {
    fn read(_ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<Self, ProtocolError> {
        Ok(Self { type_name: buffer.read_string()?, message: buffer.read_string()?, text: buffer.read_string()? })
    }

    fn write(&self, _ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        buffer.write_string(&self.type_name);
        buffer.write_string(&self.message);
        buffer.write_string(&self.text);
        Ok(())
    }
}

/// Outcome of a remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RdTaskResult<T> {
    Success(T),
    Cancelled,
    Fault(RdFault),
}

impl<T> RdTaskResult<T> {
    pub fn into_result(self) -> Result<T, TaskError> {
        match self {
            RdTaskResult::Success(value) => Ok(value),
            RdTaskResult::Cancelled => Err(TaskError::Cancelled),
            RdTaskResult::Fault(fault) => Err(TaskError::Fault(fault)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RdTaskResult::Success(_))
    }
}

impl<T: Marshaller> Marshaller for RdTaskResult<T> {
    fn read(ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<Self, ProtocolError> {
        match buffer.read_i32()? {
            0 => Ok(RdTaskResult::Success(T::read(ctx, buffer)?)),
            1 => Ok(RdTaskResult::Cancelled),
            2 => Ok(RdTaskResult::Fault(RdFault::read(ctx, buffer)?)),
            tag => Err(BufferError::InvalidTag { kind: "task result", tag: tag as i64 }.into()),
        }
    }

    fn write(&self, ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        match self {
            RdTaskResult::Success(value) => {
                buffer.write_i32(0);
                value.write(ctx, buffer)
            }
            RdTaskResult::Cancelled => {
                buffer.write_i32(1);
                Ok(())
            }
            RdTaskResult::Fault(fault) => {
                buffer.write_i32(2);
                fault.write(ctx, buffer)
            }
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

const DRIVE_INTERVAL: Duration = Duration::from_millis(5);

/// Block until `ready` yields a value from the state behind `lock` or
/// `deadline` passes. In between, work queued on `scheduler` runs on this
/// thread whenever the scheduler lets it.
fn wait_driving<S, R>(
    scheduler: Option<&dyn Scheduler>,
    lock: &Mutex<S>,
    signal: &Condvar,
    deadline: Instant,
    mut ready: impl FnMut(&mut S) -> Option<R>,
) -> Option<R> {
    loop {
        if let Some(value) = ready(&mut lock.lock()) {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        if scheduler.is_some_and(|s| s.try_run_queued()) {
            continue;
        }

        let mut state = lock.lock();
        if let Some(value) = ready(&mut state) {
            return Some(value);
        }
        let until = match scheduler {
            Some(_) => (Instant::now() + DRIVE_INTERVAL).min(deadline),
            None => deadline,
        };
        signal.wait_until(&mut state, until);
    }
}

type ResultCallback<T> = Box<dyn FnOnce(&RdTaskResult<T>) + Send>;

struct TaskState<T> {
    result: Option<RdTaskResult<T>>,
    callbacks: Vec<ResultCallback<T>>,
}

struct TaskInner<T> {
    state: Mutex<TaskState<T>>,
    done: Condvar,
    notify: watch::Sender<bool>,
    scheduler: Option<Arc<dyn Scheduler>>,
    lifetime: Option<Lifetime>,
}

/// Pending or completed result of a call. The first result set wins.
pub struct RdTask<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T> Clone for RdTask<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone + Send + 'static> RdTask<T> {
    pub fn new() -> Self {
        Self::with_context(None, None)
    }

    fn with_context(scheduler: Option<Arc<dyn Scheduler>>, lifetime: Option<Lifetime>) -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            inner: Arc::new(TaskInner {
                state: Mutex::new(TaskState { result: None, callbacks: Vec::new() }),
                done: Condvar::new(),
                notify,
                scheduler,
                lifetime,
            }),
        }
    }

    pub fn from_result(value: T) -> Self {
        let task = Self::new();
        task.set(value);
        task
    }

    pub fn faulted(fault: RdFault) -> Self {
        let task = Self::new();
        task.set_if_empty(RdTaskResult::Fault(fault));
        task
    }

    pub fn set(&self, value: T) -> bool {
        self.set_if_empty(RdTaskResult::Success(value))
    }

    /// Complete the task. Returns `false` if it already had a result.
    pub fn set_if_empty(&self, result: RdTaskResult<T>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.inner.done.notify_all();
        self.inner.notify.send_replace(true);
        for callback in callbacks {
            callback(&result);
        }
        true
    }

    pub fn result(&self) -> Option<RdTaskResult<T>> {
        self.inner.state.lock().result.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().result.is_some()
    }

    /// Run `callback` once with the result, right away if there already is
    /// one.
    pub fn on_result<F>(&self, callback: F)
    where
        F: FnOnce(&RdTaskResult<T>) + Send + 'static,
    {
        let result = {
            let mut state = self.inner.state.lock();
            match &state.result {
                Some(result) => result.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&result);
    }

    /// Block the calling thread until the task completes or `timeout`
    /// elapses, running the protocol's queued work meanwhile if nobody else
    /// drives its scheduler.
    ///
    /// Fails with [`TaskError::WaitOnScheduler`] on the protocol's scheduler
    /// thread, where the result would never be delivered.
    pub fn wait(&self, timeout: Duration) -> Result<T, TaskError> {
        let scheduler = self.inner.scheduler.as_deref();
        if scheduler.is_some_and(|s| s.is_active()) {
            return Err(TaskError::WaitOnScheduler);
        }

        let deadline = Instant::now() + timeout;
        match wait_driving(scheduler, &self.inner.state, &self.inner.done, deadline, |state| state.result.clone()) {
            Some(result) => result.into_result(),
            None => Err(TaskError::Timeout { millis: timeout.as_millis() as u64 }),
        }
    }

    /// Await the result without blocking a thread.
    pub async fn result_async(&self) -> Result<T, TaskError> {
        let mut completed = self.inner.notify.subscribe();
        loop {
            if let Some(result) = self.result() {
                return result.into_result();
            }
            if completed.changed().await.is_err() {
                return Err(TaskError::Cancelled);
            }
        }
    }

    /// Cancel the call. Has no effect on a completed task.
    pub fn cancel(&self) {
        if let Some(lifetime) = &self.inner.lifetime {
            if let Err(e) = lifetime.terminate() {
                warn!(error = %e, "call lifetime teardown failed");
            }
        }
        self.set_if_empty(RdTaskResult::Cancelled);
    }
}

impl<T: Clone + Send + 'static> Default for RdTask<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for RdTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdTask").field("result", &self.inner.state.lock().result).finish()
    }
}

// ============================================================================
// Calls
// ============================================================================

type Handler<Req, Res> = Arc<dyn Fn(&Lifetime, Req) -> RdTask<Res> + Send + Sync>;

/// A remote procedure endpoint.
///
/// # Example
///
/// ```rust,ignore
/// let square = RdCall::<i32, i32>::new();
/// protocol.bind_root(&lifetime, "square", square.as_ref())?;
///
/// // responder
/// square.set_handler(|_, x| Ok(x * x));
///
/// // requester
/// let task = square.start(&lifetime, 7)?;
/// task.on_result(|result| println!("{result:?}"));
/// ```
pub struct RdCall<Req, Res> {
    core: Arc<BindCore>,
    me: Weak<RdCall<Req, Res>>,
    handler: RwLock<Option<Handler<Req, Res>>>,
}

impl<Req, Res> RdCall<Req, Res>
where
    Req: RdValue,
    Res: RdValue,
{
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self { core: BindCore::new(), me: me.clone(), handler: RwLock::new(None) })
    }

    /// Allow starting calls from any thread.
    pub fn make_async(self: Arc<Self>) -> Arc<Self> {
        self.core.set_async(true);
        self
    }

    /// Answer incoming requests with a synchronous handler.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Lifetime, Req) -> Result<Res, RdFault> + Send + Sync + 'static,
    {
        self.set_async_handler(move |lifetime, request| match handler(lifetime, request) {
            Ok(value) => RdTask::from_result(value),
            Err(fault) => RdTask::faulted(fault),
        });
    }

    /// Answer incoming requests with a handler that completes its task
    /// later. The handler lifetime ends when the requester cancels.
    pub fn set_async_handler<F>(&self, handler: F)
    where
        F: Fn(&Lifetime, Req) -> RdTask<Res> + Send + Sync + 'static,
    {
        let previous = self.handler.write().replace(Arc::new(handler));
        if previous.is_some() {
            debug!(location = %self.core.location(), "call handler replaced");
        }
    }

    /// Send `request` to the other side. The call is cancelled when
    /// `lifetime` or the call's bind lifetime terminates first.
    pub fn start(&self, lifetime: &Lifetime, request: Req) -> Result<RdTask<Res>, ProtocolError> {
        self.core.local_change(|| {
            let location = self.core.location();
            let protocol = self.core.protocol().ok_or_else(|| ProtocolError::NotBound { location: location.clone() })?;
            let bind_lifetime = self.core.bind_lifetime().ok_or(ProtocolError::NotBound { location })?;

            let task_id = protocol.identities().next();
            let call_lifetime = Lifetime::intersect(lifetime, &bind_lifetime);
            let task = RdTask::with_context(Some(Arc::clone(protocol.scheduler())), Some(call_lifetime.clone()));

            let response: Arc<dyn WireHandler> =
                Arc::new(ResponseHandler { task: task.clone(), protocol: Arc::downgrade(&protocol) });
            protocol.wire().advise(&call_lifetime, task_id, response)?;

            let (cancelled, weak_protocol) = (task.clone(), Arc::downgrade(&protocol));
            let attached = call_lifetime.attach(move || {
                if !cancelled.set_if_empty(RdTaskResult::Cancelled) {
                    return;
                }
                if let Some(protocol) = weak_protocol.upgrade() {
                    trace!(target: "rdsync::send", %task_id, "cancel");
                    protocol.wire().send(task_id, &[]);
                }
            });
            if attached.is_err() {
                task.set_if_empty(RdTaskResult::Cancelled);
                return Ok(task);
            }

            let finished = call_lifetime.clone();
            task.on_result(move |_| {
                if let Err(e) = finished.terminate() {
                    warn!(error = %e, "call lifetime teardown failed");
                }
            });

            trace!(target: "rdsync::send", location = %self.core.location(), %task_id, "request");
            self.core.send(|ctx, buffer| {
                buffer.write_rd_id(task_id);
                request.write(ctx, buffer)
            })?;
            Ok(task)
        })?
    }

    /// Start a call and block until it completes.
    ///
    /// Must be called off the scheduler. A call that is not async is started
    /// on the scheduler, this thread waits for that too. Logs a warning when
    /// the call takes longer than `timeouts.warn`, and cancels it with
    /// [`TaskError::Timeout`] after `timeouts.error`. Without explicit
    /// timeouts the protocol's configured ones apply.
    pub fn sync(&self, request: Req, timeouts: Option<RpcTimeouts>) -> Result<Res, TaskError> {
        let protocol = self.core.protocol();
        let timeouts = timeouts.or_else(|| protocol.as_ref().map(|p| p.config().rpc_timeouts)).unwrap_or_default();
        let timed_out = || TaskError::Timeout { millis: timeouts.error_ms };

        let started = Instant::now();
        let deadline = started + timeouts.error();
        let task = match protocol {
            Some(protocol) if protocol.scheduler().is_active() => return Err(TaskError::WaitOnScheduler),
            Some(protocol) if !self.core.is_async() => {
                self.start_on(protocol.scheduler(), request, deadline)?.ok_or_else(|| {
                    error!(location = %self.core.location(), millis = timeouts.error_ms, "sync call was never started");
                    timed_out()
                })?
            }
            _ => self.start(&Lifetime::eternal(), request)?,
        };

        let result = match task.wait(deadline.saturating_duration_since(Instant::now())) {
            Err(TaskError::Timeout { .. }) => Err(timed_out()),
            other => other,
        };
        let elapsed = started.elapsed();

        match &result {
            Err(TaskError::Timeout { millis }) => {
                error!(location = %self.core.location(), millis, "sync call timed out");
                task.cancel();
            }
            _ if elapsed > timeouts.warn() => {
                warn!(location = %self.core.location(), millis = elapsed.as_millis() as u64, "sync call was slow");
            }
            _ => {}
        }
        result
    }

    /// Run `start` on `scheduler` and wait for it until `deadline`. `None`
    /// if the scheduler did not get to it in time; it is then skipped.
    fn start_on(
        &self,
        scheduler: &Arc<dyn Scheduler>,
        request: Req,
        deadline: Instant,
    ) -> Result<Option<RdTask<Res>>, ProtocolError> {
        let handoff = Arc::new(Handoff { state: Mutex::new(HandoffState::Waiting), ready: Condvar::new() });

        let (call, sender) = (self.me.clone(), Arc::clone(&handoff));
        scheduler.queue(Box::new(move || {
            if matches!(*sender.state.lock(), HandoffState::Abandoned) {
                return;
            }
            let Some(call) = call.upgrade() else {
                return;
            };
            let started = call.start(&Lifetime::eternal(), request);

            let mut state = sender.state.lock();
            if matches!(*state, HandoffState::Abandoned) {
                if let Ok(task) = started {
                    task.cancel();
                }
                return;
            }
            *state = HandoffState::Started(started);
            drop(state);
            sender.ready.notify_all();
        }));

        let started = wait_driving(Some(scheduler.as_ref()), &handoff.state, &handoff.ready, deadline, |state| {
            match std::mem::replace(state, HandoffState::Waiting) {
                HandoffState::Started(started) => Some(started),
                other => {
                    *state = other;
                    None
                }
            }
        });
        match started {
            Some(started) => started.map(Some),
            None => {
                *handoff.state.lock() = HandoffState::Abandoned;
                Ok(None)
            }
        }
    }

    fn respond(&self, protocol: &Arc<Protocol>, task_id: RdId, request: Req) -> Result<(), ProtocolError> {
        let Some(bind_lifetime) = self.core.bind_lifetime() else {
            return Ok(());
        };
        let handler_lifetime = bind_lifetime.create_nested();
        let cancel: Arc<dyn WireHandler> = Arc::new(CancelHandler { lifetime: handler_lifetime.clone() });
        protocol.wire().advise(&handler_lifetime, task_id, cancel)?;

        let handler = self.handler.read().clone();
        let task = match handler {
            Some(handler) => panic::catch_unwind(AssertUnwindSafe(|| handler(&handler_lifetime, request)))
                .unwrap_or_else(|payload| RdTask::faulted(RdFault::from_panic(payload))),
            None => RdTask::faulted(RdFault::new(
                "MissingHandler",
                format!("no handler for `{}`", self.core.location()),
            )),
        };

        let cancelled = task.clone();
        handler_lifetime.on_termination_if_alive(move || {
            cancelled.set_if_empty(RdTaskResult::Cancelled);
        });

        let weak_protocol = Arc::downgrade(protocol);
        let done = handler_lifetime.clone();
        task.on_result(move |result| {
            let sent = done.execute_if_alive(|| {
                let Some(protocol) = weak_protocol.upgrade() else {
                    return Ok(());
                };
                let mut buffer = Buffer::new();
                result.write(protocol.serialization_ctx(), &mut buffer)?;
                trace!(target: "rdsync::send", %task_id, success = result.is_success(), "response");
                protocol.wire().send(task_id, buffer.as_slice());
                Ok::<_, ProtocolError>(())
            });
            match sent {
                Some(Err(e)) => error!(%task_id, error = %e, "failed to send response"),
                None => trace!(%task_id, "response dropped, call was cancelled"),
                Some(Ok(())) => {}
            }
            if let Err(e) = done.terminate() {
                warn!(error = %e, "handler lifetime teardown failed");
            }
        });
        Ok(())
    }
}

impl<Req, Res> WireHandler for RdCall<Req, Res>
where
    Req: RdValue,
    Res: RdValue,
{
    fn on_wire_received(&self, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        let Some(protocol) = self.core.protocol() else {
            return Ok(());
        };
        let task_id = buffer.read_rd_id()?;
        let request = Req::read(protocol.serialization_ctx(), buffer)?;
        trace!(target: "rdsync::recv", location = %self.core.location(), %task_id, "request");
        self.respond(&protocol, task_id, request)
    }
}

enum HandoffState<T> {
    Waiting,
    Started(Result<RdTask<T>, ProtocolError>),
    Abandoned,
}

/// Carries the task of a call started on the scheduler back to the thread
/// waiting in `sync`.
struct Handoff<T> {
    state: Mutex<HandoffState<T>>,
    ready: Condvar,
}

struct ResponseHandler<T> {
    task: RdTask<T>,
    protocol: Weak<Protocol>,
}

impl<T: RdValue> WireHandler for ResponseHandler<T> {
    fn on_wire_received(&self, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        let Some(protocol) = self.protocol.upgrade() else {
            return Ok(());
        };
        let result = RdTaskResult::<T>::read(protocol.serialization_ctx(), buffer)?;
        if !self.task.set_if_empty(result) {
            trace!(target: "rdsync::recv", "late response dropped");
        }
        Ok(())
    }
}

struct CancelHandler {
    lifetime: Lifetime,
}

impl WireHandler for CancelHandler {
    fn on_wire_received(&self, _buffer: &mut Buffer) -> Result<(), ProtocolError> {
        trace!(target: "rdsync::recv", "call cancelled by requester");
        self.lifetime.terminate()?;
        Ok(())
    }
}

impl<Req, Res> RdDynamic for RdCall<Req, Res>
where
    Req: RdValue,
    Res: RdValue,
{
    fn protocol(&self) -> Option<Arc<Protocol>> {
        self.core.protocol()
    }

    fn location(&self) -> String {
        self.core.location()
    }
}

impl<Req, Res> RdBindable for RdCall<Req, Res>
where
    Req: RdValue,
    Res: RdValue,
{
    fn rd_id(&self) -> RdId {
        self.core.rd_id()
    }

    fn identify(&self, _identities: &Identities, id: RdId) -> Result<(), ProtocolError> {
        self.core.identify(id)
    }

    fn bind(&self, lifetime: &Lifetime, parent: &dyn RdDynamic, name: &str) -> Result<(), ProtocolError> {
        let handler: Arc<dyn WireHandler> = self
            .me
            .upgrade()
            .ok_or_else(|| ProtocolError::NotBound { location: self.core.location() })?;
        self.core.bind(lifetime, parent, name, Some(handler))?;
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.core.is_bound()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ManualScheduler, Serializers};
    use std::thread;

    #[test]
    fn first_result_wins() {
        let task = RdTask::<i32>::new();
        assert!(task.set(1));
        assert!(!task.set_if_empty(RdTaskResult::Cancelled));
        assert_eq!(task.result(), Some(RdTaskResult::Success(1)));
    }

    #[test]
    fn on_result_runs_once_in_either_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let task = RdTask::<i32>::new();
        let seen_clone = seen.clone();
        task.on_result(move |r| seen_clone.lock().push(r.clone()));
        task.set(2);
        task.set(3);

        let seen_clone = seen.clone();
        task.on_result(move |r| seen_clone.lock().push(r.clone()));

        assert_eq!(*seen.lock(), vec![RdTaskResult::Success(2), RdTaskResult::Success(2)]);
    }

    #[test]
    fn wait_times_out() {
        let task = RdTask::<i32>::new();
        assert_eq!(task.wait(Duration::from_millis(20)), Err(TaskError::Timeout { millis: 20 }));
    }

    #[test]
    fn wait_sees_result_from_other_thread() {
        let task = RdTask::<String>::new();
        let setter = task.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            setter.set("done".into());
        });

        assert_eq!(task.wait(Duration::from_secs(5)).unwrap(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn wait_runs_work_queued_on_an_idle_scheduler() {
        let scheduler = Arc::new(ManualScheduler::new());
        let task = RdTask::<i32>::with_context(Some(scheduler.clone()), None);
        let setter = task.clone();
        scheduler.queue(Box::new(move || {
            setter.set(11);
        }));

        assert_eq!(task.wait(Duration::from_secs(5)), Ok(11));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn wait_leaves_a_busy_scheduler_to_its_driver() {
        let scheduler = Arc::new(ManualScheduler::new());
        let task = RdTask::<i32>::with_context(Some(scheduler.clone()), None);
        let setter = task.clone();
        scheduler.queue(Box::new(move || {
            setter.set(12);
        }));

        let driver = {
            let scheduler = scheduler.clone();
            thread::spawn(move || {
                scheduler.run(|| thread::sleep(Duration::from_millis(30)));
            })
        };
        assert_eq!(task.wait(Duration::from_secs(5)), Ok(12));
        driver.join().unwrap();
    }

    #[test]
    fn cancel_resolves_pending_task() {
        let task = RdTask::<i32>::new();
        task.cancel();
        assert_eq!(task.wait(Duration::from_millis(1)), Err(TaskError::Cancelled));

        let done = RdTask::from_result(5);
        done.cancel();
        assert_eq!(done.result(), Some(RdTaskResult::Success(5)));
    }

    #[test]
    fn fault_survives_the_wire_format() {
        let ctx = SerializationCtx::new(Arc::new(Serializers::new()));
        let fault = RdFault::new("IllegalState", "boom");
        let mut buffer = Buffer::new();
        RdTaskResult::<i32>::Fault(fault.clone()).write(&ctx, &mut buffer).unwrap();
        buffer.rewind();

        assert_eq!(RdTaskResult::<i32>::read(&ctx, &mut buffer).unwrap(), RdTaskResult::Fault(fault));
        assert_eq!(RdFault::new("IllegalState", "boom").to_string(), "IllegalState: boom");
    }

    #[test]
    fn panic_payload_becomes_fault_message() {
        let payload = panic::catch_unwind(|| panic!("handler exploded")).unwrap_err();
        let fault = RdFault::from_panic(payload);
        assert_eq!(fault.type_name, "Panic");
        assert_eq!(fault.message, "handler exploded");
    }

    #[tokio::test]
    async fn result_async_resolves_without_blocking() {
        let task = RdTask::<i32>::new();
        let setter = task.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            setter.set(42);
        });

        assert_eq!(task.result_async().await, Ok(42));
    }
}
