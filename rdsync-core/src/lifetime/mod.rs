//! Lifetimes
//!
//! Everything in rdsync that owns a resource (a subscription, a bound entity,
//! a pending RPC) is scoped to a [`Lifetime`]. Terminating a lifetime tears the
//! resource down.
//!
//! # How It Works
//!
//! Lifetimes form a tree. [`Lifetime::create_nested`] adds a child that is
//! terminated together with its parent, and teardown proceeds children first
//! (newest to oldest), then the parent's own actions in reverse attach order.
//!
//! ```text
//!     root ──┬── protocol ──┬── property binding
//!            │              └── call binding ── pending task
//!            └── connection
//! ```
//!
//! Guarded work runs through [`Lifetime::execute_if_alive`]; a termination that
//! starts meanwhile waits (bounded) for it before running cleanup.

mod context;
mod definition;
mod sequential;

pub use definition::{Lifetime, LifetimeStatus, DEFAULT_TERMINATION_WAIT};
pub use sequential::SequentialLifetimes;
