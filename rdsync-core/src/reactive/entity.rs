//! Entity Binding
//!
//! Every synchronized entity goes through the same lifecycle:
//!
//! ```text
//!   constructed ──identify──► identified ──bind──► bound ──lifetime ends──► unbound
//!                                  ▲                                         │
//!                                  └────────────── identify again ───────────┘
//! ```
//!
//! [`BindCore`] holds that state for one entity and implements the parts every
//! entity shares: the bind checks, unbinding on lifetime termination, the
//! local-change guard and sending. Entity types embed a core and add their own
//! value semantics on top.
//!
//! # Local Changes
//!
//! Mutations go through [`BindCore::local_change`], which rejects:
//!
//! - writes after unbind
//! - writes to a bound, non-async entity from outside its scheduler
//! - a write issued from inside another write of the same entity
//!
//! The reentrancy flag is an atomic owned by the entity, not thread-local
//! state.
//!
//! # Roles
//!
//! Entities that can be changed on both sides while disconnected carry a
//! [`Role`]. The master side's changes win a conflict. Unless set per entity,
//! the server endpoint is master.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::error::ProtocolError;
use crate::lifetime::Lifetime;
use crate::protocol::{Buffer, Identities, Protocol, RdId, SerializationCtx, WireHandler};

/// Anything that has a place in a protocol's entity tree.
pub trait RdDynamic: Send + Sync {
    /// The protocol this node is bound to, if any.
    fn protocol(&self) -> Option<Arc<Protocol>>;

    /// Dotted path of this node, for diagnostics.
    fn location(&self) -> String;
}

/// An entity that can be identified and bound under a parent.
pub trait RdBindable: RdDynamic {
    fn rd_id(&self) -> RdId;

    /// Assign the id. Fails if the entity already has one or `id` is null.
    fn identify(&self, identities: &Identities, id: RdId) -> Result<(), ProtocolError>;

    /// Attach the entity to `parent`'s protocol until `lifetime` terminates.
    fn bind(&self, lifetime: &Lifetime, parent: &dyn RdDynamic, name: &str) -> Result<(), ProtocolError>;

    fn is_bound(&self) -> bool;
}

/// Binding state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    NotBound,
    Bound,
    Unbound,
}

struct Binding {
    location: String,
    state: BindState,
    protocol: Weak<Protocol>,
    lifetime: Lifetime,
}

/// Shared binding state embedded in every entity.
pub(crate) struct BindCore {
    id: AtomicI64,
    binding: Mutex<Binding>,
    in_local_change: AtomicBool,
    is_async: AtomicBool,
    unsynced: AtomicBool,
}

impl BindCore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: AtomicI64::new(RdId::NULL.value()),
            binding: Mutex::new(Binding {
                location: "<<not bound>>".to_string(),
                state: BindState::NotBound,
                protocol: Weak::new(),
                lifetime: Lifetime::terminated(),
            }),
            in_local_change: AtomicBool::new(false),
            is_async: AtomicBool::new(false),
            unsynced: AtomicBool::new(false),
        })
    }

    pub(crate) fn rd_id(&self) -> RdId {
        RdId::new(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn location(&self) -> String {
        self.binding.lock().location.clone()
    }

    pub(crate) fn state(&self) -> BindState {
        self.binding.lock().state
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.state() == BindState::Bound
    }

    /// The protocol, only while bound.
    pub(crate) fn protocol(&self) -> Option<Arc<Protocol>> {
        let binding = self.binding.lock();
        match binding.state {
            BindState::Bound => binding.protocol.upgrade(),
            _ => None,
        }
    }

    pub(crate) fn bind_lifetime(&self) -> Option<Lifetime> {
        let binding = self.binding.lock();
        (binding.state == BindState::Bound).then(|| binding.lifetime.clone())
    }

    pub(crate) fn is_async(&self) -> bool {
        self.is_async.load(Ordering::Acquire)
    }

    pub(crate) fn set_async(&self, is_async: bool) {
        self.is_async.store(is_async, Ordering::Release);
    }

    pub(crate) fn identify(&self, id: RdId) -> Result<(), ProtocolError> {
        if id.is_null() {
            return Err(ProtocolError::NullId { location: self.location() });
        }
        self.id
            .compare_exchange(RdId::NULL.value(), id.value(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| ProtocolError::AlreadyIdentified { location: self.location(), id: RdId::new(current) })
    }

    /// Bind to `parent`'s protocol and register `handler` for this entity's
    /// id. Returns the protocol bound to.
    pub(crate) fn bind(
        self: &Arc<Self>,
        lifetime: &Lifetime,
        parent: &dyn RdDynamic,
        name: &str,
        handler: Option<Arc<dyn WireHandler>>,
    ) -> Result<Arc<Protocol>, ProtocolError> {
        let location = format!("{}.{}", parent.location(), name);
        let protocol = parent
            .protocol()
            .ok_or_else(|| ProtocolError::ParentNotBound { location: parent.location() })?;

        let id = self.rd_id();
        if id.is_null() {
            return Err(ProtocolError::NotIdentified { location });
        }
        if !self.is_async() && !protocol.scheduler().is_active() {
            return Err(ProtocolError::WrongThread { location });
        }

        {
            let mut binding = self.binding.lock();
            if binding.state == BindState::Bound {
                return Err(ProtocolError::AlreadyBound { location: binding.location.clone() });
            }
            binding.state = BindState::Bound;
            binding.location = location;
            binding.protocol = Arc::downgrade(&protocol);
            binding.lifetime = lifetime.clone();
        }

        let core = Arc::downgrade(self);
        let attached = lifetime.attach(move || {
            if let Some(core) = core.upgrade() {
                core.unbind();
            }
        });
        if let Err(e) = attached {
            self.unbind();
            return Err(e.into());
        }

        if let Some(handler) = handler {
            if let Err(e) = protocol.wire().advise(lifetime, id, handler) {
                self.unbind();
                return Err(e);
            }
        }

        trace!(location = %self.location(), %id, "bound");
        Ok(protocol)
    }

    fn unbind(&self) {
        let mut binding = self.binding.lock();
        if binding.state != BindState::Bound {
            return;
        }
        binding.state = BindState::Unbound;
        binding.protocol = Weak::new();
        binding.lifetime = Lifetime::terminated();
        self.id.store(RdId::NULL.value(), Ordering::Release);
        trace!(location = %binding.location, "unbound");
    }

    /// Run `change` as a local mutation of this entity.
    pub(crate) fn local_change<R>(&self, change: impl FnOnce() -> R) -> Result<R, ProtocolError> {
        {
            let binding = self.binding.lock();
            match binding.state {
                BindState::Unbound => return Err(ProtocolError::Unbound { location: binding.location.clone() }),
                BindState::Bound if !self.is_async() => {
                    let on_scheduler = binding.protocol.upgrade().map_or(true, |p| p.scheduler().is_active());
                    if !on_scheduler {
                        return Err(ProtocolError::WrongThread { location: binding.location.clone() });
                    }
                }
                _ => {}
            }
        }

        if self.in_local_change.swap(true, Ordering::AcqRel) {
            return Err(ProtocolError::ReentrantLocalChange { location: self.location() });
        }
        let _reset = ResetOnDrop(&self.in_local_change);
        Ok(change())
    }

    /// Send a message on this entity's id.
    ///
    /// While unbound or disconnected nothing is sent and the entity is marked
    /// unsynced instead.
    pub(crate) fn send<F>(&self, writer: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&SerializationCtx, &mut Buffer) -> Result<(), ProtocolError>,
    {
        self.send_on(self.rd_id(), writer)
    }

    pub(crate) fn send_on<F>(&self, id: RdId, writer: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&SerializationCtx, &mut Buffer) -> Result<(), ProtocolError>,
    {
        self.try_send_on(id, writer).map(|_| ())
    }

    /// Like [`send`](Self::send), but reports whether the message went out.
    pub(crate) fn try_send<F>(&self, writer: F) -> Result<bool, ProtocolError>
    where
        F: FnOnce(&SerializationCtx, &mut Buffer) -> Result<(), ProtocolError>,
    {
        self.try_send_on(self.rd_id(), writer)
    }

    fn try_send_on<F>(&self, id: RdId, writer: F) -> Result<bool, ProtocolError>
    where
        F: FnOnce(&SerializationCtx, &mut Buffer) -> Result<(), ProtocolError>,
    {
        let Some(protocol) = self.protocol() else {
            self.mark_unsynced();
            return Ok(false);
        };
        if !protocol.wire().is_connected() {
            self.mark_unsynced();
            trace!(target: "rdsync::send", location = %self.location(), "not connected, kept for resync");
            return Ok(false);
        }

        let mut buffer = Buffer::new();
        writer(protocol.serialization_ctx(), &mut buffer)?;
        protocol.wire().send(id, buffer.as_slice());
        Ok(true)
    }

    /// Returns `false` if the entity was already marked.
    pub(crate) fn mark_unsynced(&self) -> bool {
        !self.unsynced.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_unsynced(&self) {
        self.unsynced.store(false, Ordering::Release);
    }

    /// Returns whether there was unsent state, clearing the flag.
    pub(crate) fn take_unsynced(&self) -> bool {
        self.unsynced.swap(false, Ordering::AcqRel)
    }

    /// Call `resync` on the scheduler whenever the wire is (re)connected
    /// while `lifetime` is alive, including right away if it already is.
    pub(crate) fn advise_resync<E>(
        &self,
        lifetime: &Lifetime,
        protocol: &Arc<Protocol>,
        entity: Weak<E>,
        resync: fn(&E) -> Result<(), ProtocolError>,
    ) where
        E: Send + Sync + 'static,
    {
        let scheduler = Arc::clone(protocol.scheduler());
        protocol.wire().connected().advise(lifetime, move |connected| {
            if !*connected {
                return;
            }
            let entity = entity.clone();
            scheduler.invoke_or_queue(move || {
                if let Some(entity) = entity.upgrade() {
                    if let Err(e) = resync(&entity) {
                        error!(error = %e, "resync failed");
                    }
                }
            });
        });
    }

    /// Queue one `resync` behind the messages already waiting on the
    /// scheduler.
    pub(crate) fn queue_resync<E>(&self, entity: Weak<E>, resync: fn(&E) -> Result<(), ProtocolError>)
    where
        E: Send + Sync + 'static,
    {
        let Some(protocol) = self.protocol() else {
            return;
        };
        protocol.scheduler().queue(Box::new(move || {
            if let Some(entity) = entity.upgrade() {
                if let Err(e) = resync(&entity) {
                    error!(error = %e, "resync failed");
                }
            }
        }));
    }
}

const ROLE_DEFAULT: u8 = 0;
const ROLE_MASTER: u8 = 1;
const ROLE_SLAVE: u8 = 2;

/// Conflict role of one entity.
pub(crate) struct Role(AtomicU8);

impl Role {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ROLE_DEFAULT))
    }

    pub(crate) fn set_master(&self, master: bool) {
        self.0.store(if master { ROLE_MASTER } else { ROLE_SLAVE }, Ordering::Release);
    }

    /// The explicit role if one was set, otherwise the endpoint's. An
    /// unbound entity without an explicit role is a slave.
    pub(crate) fn is_master(&self, core: &BindCore) -> bool {
        match self.0.load(Ordering::Acquire) {
            ROLE_MASTER => true,
            ROLE_SLAVE => false,
            _ => core.protocol().is_some_and(|p| p.is_master()),
        }
    }
}

struct ResetOnDrop<'a>(&'a AtomicBool);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_twice_fails() {
        let core = BindCore::new();
        core.identify(RdId::new(5)).unwrap();

        assert!(matches!(
            core.identify(RdId::new(6)),
            Err(ProtocolError::AlreadyIdentified { id, .. }) if id == RdId::new(5)
        ));
    }

    #[test]
    fn null_id_is_rejected() {
        let core = BindCore::new();
        assert!(matches!(core.identify(RdId::NULL), Err(ProtocolError::NullId { .. })));
    }

    #[test]
    fn reentrant_local_change_fails() {
        let core = BindCore::new();
        let inner = core.local_change(|| core.local_change(|| ())).unwrap();

        assert!(matches!(inner, Err(ProtocolError::ReentrantLocalChange { .. })));
        assert!(core.local_change(|| ()).is_ok());
    }

    #[test]
    fn send_while_not_bound_marks_unsynced() {
        let core = BindCore::new();
        core.send(|_, buffer| {
            buffer.write_i32(1);
            Ok(())
        })
        .unwrap();

        assert!(core.take_unsynced());
        assert!(!core.take_unsynced());
    }
}
