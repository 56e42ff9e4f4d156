//! Error taxonomy.
//!
//! Protocol violations are caller bugs and surface at the violating call.
//! Transport faults are logged and reported through the wire's `connected`
//! property rather than returned to entity code. RPC faults travel as data
//! inside [`RdTaskResult`](crate::reactive::RdTaskResult).

use thiserror::Error;

use crate::protocol::RdId;
use crate::reactive::RdFault;

/// Errors raised by [`Lifetime`](crate::lifetime::Lifetime) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifetimeError {
    /// The lifetime is no longer alive, nothing can be attached to it.
    #[error("lifetime is terminated")]
    Terminated,

    /// One or more termination actions panicked. All actions still ran.
    #[error("{} termination action(s) failed: {}", failures.len(), failures.join("; "))]
    TerminationFailed { failures: Vec<String> },
}

/// Errors produced while reading from a [`Buffer`](crate::protocol::Buffer).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("unexpected end of buffer: needed {needed} byte(s), {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid {kind} tag {tag}")]
    InvalidTag { kind: &'static str, tag: i64 },
}

/// Violations of the synchronization protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("`{location}` already has id {id}")]
    AlreadyIdentified { location: String, id: RdId },

    #[error("assigned id for `{location}` must not be null")]
    NullId { location: String },

    #[error("`{location}` must be identified before binding")]
    NotIdentified { location: String },

    #[error("`{location}` is already bound")]
    AlreadyBound { location: String },

    #[error("parent `{location}` is not bound to a protocol")]
    ParentNotBound { location: String },

    #[error("`{location}` is not bound")]
    NotBound { location: String },

    #[error("`{location}` was unbound, writes are no longer accepted")]
    Unbound { location: String },

    #[error("local change of `{location}` invoked recursively")]
    ReentrantLocalChange { location: String },

    #[error("`{location}` accessed outside of its protocol scheduler")]
    WrongThread { location: String },

    #[error("a handler for id {id} is already registered")]
    DuplicateSubscription { id: RdId },

    #[error("intern index {index} is owned by this side and cannot be assigned remotely")]
    InternOwnership { index: i32 },

    #[error("no interned value for index {index}")]
    UnknownInternId { index: i32 },

    #[error("list index {index} out of bounds for `{location}` of length {len}")]
    ListIndex { location: String, index: i32, len: usize },

    #[error("no serializer registered for type id {id}")]
    UnknownType { id: RdId },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Lifetime(#[from] LifetimeError),
}

/// Faults of the byte-stream transport under a wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport is closed")]
    Closed,

    #[error("malformed frame: declared length {length} is outside 8..={max}")]
    MalformedFrame { length: u32, max: u32 },
}

/// Errors raised by [`Scheduler`](crate::protocol::Scheduler) implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("flush called from inside a queued action")]
    FlushFromQueuedAction,

    #[error("scheduler is stopped")]
    Stopped,

    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(String),
}

/// Errors returned when awaiting an RPC result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task did not complete within {millis} ms")]
    Timeout { millis: u64 },

    #[error("blocking wait on the scheduler thread would stall delivery of the result")]
    WaitOnScheduler,

    #[error("task was cancelled")]
    Cancelled,

    #[error("task faulted: {0}")]
    Fault(RdFault),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
