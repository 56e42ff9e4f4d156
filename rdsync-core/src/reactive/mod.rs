//! Synchronized Entities
//!
//! The types in this module are what application code works with: values and
//! collections that live on both endpoints and stay equal.
//!
//! # Concepts
//!
//! ## Binding
//!
//! An entity starts out as a plain local value. Once identified and bound
//! under a protocol it sends each local change to the other side and applies
//! changes the other side sends. Binding ends with the lifetime it was bound
//! with.
//!
//! ## Changes
//!
//! Subscribers receive a [`Change`]: the event plus its [`Origin`], so code
//! can tell its own writes from the peer's.
//!
//! ## Entity Kinds
//!
//! - [`RdProperty`]: a single value with master/slave conflict resolution
//! - [`RdSignal`]: fire-and-forget events
//! - [`RdList`], [`RdSet`], [`RdMap`]: collections replicated by operation
//! - [`RdCall`]: request/response, producing an [`RdTask`]
//! - [`InternRoot`]: value deduplication for the wire
//! - [`RdModel`]: a named group of any of the above
//!
//! # Implementation Notes
//!
//! Every entity embeds the same binding core and implements [`RdBindable`]
//! plus the wire handler trait; there is no entity base class to inherit from.

mod call;
mod entity;
mod intern;
mod keyed;
mod list;
mod map;
mod model;
mod op;
mod property;
mod set;
mod signal;
mod viewable;

pub use call::{RdCall, RdFault, RdTask, RdTaskResult};
pub use entity::{BindState, RdBindable, RdDynamic};
pub use intern::{InternRoot, Internable};
pub use list::RdList;
pub use map::RdMap;
pub use model::RdModel;
pub use op::{ListEvent, MapEvent, OpKind, SetEvent};
pub use property::RdProperty;
pub use set::RdSet;
pub use signal::RdSignal;
pub use viewable::{Change, Origin, Source, SubscriberId, ViewableProperty};

use crate::protocol::Marshaller;

/// Values that synchronized entities can hold.
pub trait RdValue: Marshaller + Clone + Send + Sync + 'static {}

impl<T> RdValue for T where T: Marshaller + Clone + Send + Sync + 'static {}
