//! rdsync Core
//!
//! This crate implements a reactive object synchronization protocol: two
//! endpoints hold the same tree of entities (properties, signals, lists, sets,
//! maps, calls) and every change made on one side is replayed on the other.
//!
//! It implements:
//!
//! - Hierarchical lifetimes for cancellation and resource cleanup
//! - Deterministic entity ids, identical on both endpoints
//! - Length-prefixed wire framing and per-entity message dispatch
//! - Single-writer schedulers
//! - Synchronized entities and remote calls
//! - Value interning
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `lifetime`: cancellation tokens with ordered, exactly-once teardown
//! - `protocol`: ids, buffers, serializers, wire, broker, schedulers and the
//!   per-endpoint [`Protocol`](protocol::Protocol)
//! - `reactive`: the synchronized entity types
//! - `config` / `error`: endpoint configuration and error types
//!
//! # Example
//!
//! ```rust,ignore
//! use rdsync_core::config::ProtocolConfig;
//! use rdsync_core::lifetime::Lifetime;
//! use rdsync_core::protocol::{FramedWire, ManualScheduler, Protocol};
//! use rdsync_core::reactive::RdProperty;
//!
//! let lifetime = Lifetime::new();
//! let scheduler = Arc::new(ManualScheduler::new());
//! let config = ProtocolConfig::client("client");
//! let wire = FramedWire::new(scheduler.clone(), &config);
//! let protocol = Protocol::new(config, scheduler.clone(), wire, &lifetime)?;
//!
//! let counter = RdProperty::new(0);
//! scheduler.run(|| protocol.bind_root(&lifetime, "counter", counter.as_ref()))?;
//!
//! // Sent once the wire is connected; the other side sees Origin::Remote.
//! scheduler.run(|| counter.set(5))?;
//! ```

pub mod config;
pub mod error;
pub mod lifetime;
pub mod protocol;
pub mod reactive;
