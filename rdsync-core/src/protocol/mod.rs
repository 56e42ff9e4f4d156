//! Protocol Plumbing
//!
//! Everything between an entity and the byte stream:
//!
//! - `id`: [`RdId`] and the [`Identities`] allocator
//! - `buffer`: the little-endian [`Buffer`]
//! - `serializer`: [`Marshaller`], [`MsgPack`], [`Serializers`], [`SerializationCtx`]
//! - `scheduler`: [`Scheduler`], [`ThreadScheduler`], [`ManualScheduler`]
//! - `broker`: [`MessageBroker`], the bind-order tolerant inbound router
//! - `wire`: [`Wire`], [`Transport`] and the length-prefixed [`FramedWire`]
//! - `loopback`: [`LoopbackTransport`] for two endpoints in one process
//! - `endpoint`: [`Protocol`], the composition root of one endpoint
//!
//! # Message Flow
//!
//! ```text
//!   entity.set(v)                                    entity.on_wire_received
//!        │                                                    ▲
//!        ▼                                                    │
//!   Wire::send ──► Transport ──► FramedWire::receive ──► MessageBroker
//!                                                      (queued on Scheduler)
//! ```

mod broker;
mod buffer;
mod endpoint;
mod id;
mod loopback;
mod scheduler;
mod serializer;
mod wire;

pub use broker::MessageBroker;
pub use buffer::Buffer;
pub use endpoint::{Protocol, PROTOCOL_INTERN_SCOPE};
pub use id::{IdKind, Identities, RdId};
pub use loopback::LoopbackTransport;
pub use scheduler::{Action, ManualScheduler, Scheduler, ThreadScheduler};
pub use serializer::{Marshaller, MsgPack, SerializationCtx, Serializers};
pub use wire::{FramedWire, Transport, Wire, WireHandler};
