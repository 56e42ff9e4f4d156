//! Value Interning
//!
//! An intern root replaces repeated values on the wire with small integer
//! indices. The first time a value is interned it is sent once, together with
//! its index. From then on both sides can refer to it by index.
//!
//! # Index Ownership
//!
//! The low bit of an index says who allocated it, from the point of view of
//! the side holding it:
//!
//! ```text
//!   even   allocated here          -> local table
//!   odd    allocated by the peer   -> remote table
//! ```
//!
//! Every index is flipped (`index ^ 1`) when written to the wire, so the
//! receiver reads it in its own perspective without any coordination. `-1`
//! is never flipped; it marks a value written inline.
//!
//! Both sides may intern the same value independently. The value then has one
//! index per side; lookups return whichever was seen first and removal drops
//! both.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::error::ProtocolError;
use crate::lifetime::Lifetime;
use crate::protocol::{Buffer, Identities, Marshaller, Protocol, RdId, WireHandler};

use super::entity::{BindCore, RdBindable, RdDynamic};

/// Values that can be interned: serializable and hashable by structure.
pub trait Internable: Marshaller + Clone + Eq + Hash + Send + Sync + 'static {}

impl<T> Internable for T where T: Marshaller + Clone + Eq + Hash + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy)]
struct Indices {
    id: i32,
    extra: Option<i32>,
}

/// Per-protocol table of interned values of type `T`.
pub struct InternRoot<T> {
    core: Arc<BindCore>,
    me: Weak<InternRoot<T>>,
    local: RwLock<Vec<Option<T>>>,
    remote: DashMap<i32, T>,
    inverse: DashMap<T, Indices>,
}

impl<T: Internable> InternRoot<T> {
    /// Intern roots accept writes from any thread.
    pub fn new() -> Arc<Self> {
        let core = BindCore::new();
        core.set_async(true);
        Arc::new_cyclic(|me| Self {
            core,
            me: me.clone(),
            local: RwLock::new(Vec::new()),
            remote: DashMap::new(),
            inverse: DashMap::new(),
        })
    }

    /// The index as the peer sees it.
    pub fn wire_index(index: i32) -> i32 {
        if index == -1 {
            -1
        } else {
            index ^ 1
        }
    }

    /// Index of `value`, allocating and sending it if it has none yet.
    pub fn intern(&self, value: &T) -> Result<i32, ProtocolError> {
        if let Some(indices) = self.inverse.get(value) {
            return Ok(indices.id);
        }

        let index = match self.inverse.entry(value.clone()) {
            Entry::Occupied(entry) => return Ok(entry.get().id),
            Entry::Vacant(entry) => {
                let mut local = self.local.write();
                let index = (local.len() * 2) as i32;
                local.push(Some(value.clone()));
                entry.insert(Indices { id: index, extra: None });
                index
            }
        };

        trace!(location = %self.core.location(), index, "interned");
        self.send_value(value, index)?;
        Ok(index)
    }

    /// Index of `value` if it has been interned by either side.
    pub fn try_get_interned(&self, value: &T) -> Option<i32> {
        self.inverse.get(value).map(|indices| indices.id)
    }

    pub fn un_intern(&self, index: i32) -> Result<T, ProtocolError> {
        let found = if index < 0 {
            None
        } else if index & 1 == 0 {
            self.local.read().get((index / 2) as usize).cloned().flatten()
        } else {
            self.remote.get(&index).map(|value| value.clone())
        };
        found.ok_or(ProtocolError::UnknownInternId { index })
    }

    /// Forget `value` on this side. Indices already sent stay valid on the
    /// peer.
    pub fn remove(&self, value: &T) {
        let Some((_, indices)) = self.inverse.remove(value) else {
            return;
        };
        for index in std::iter::once(indices.id).chain(indices.extra) {
            if index & 1 == 0 {
                if let Some(slot) = self.local.write().get_mut((index / 2) as usize) {
                    *slot = None;
                }
            } else {
                self.remote.remove(&index);
            }
        }
    }

    /// Record that the peer allocated `index` for `value`. Only peer-owned
    /// (odd) indices are accepted.
    pub fn set_interned_correspondence(&self, index: i32, value: T) -> Result<(), ProtocolError> {
        if index & 1 == 0 {
            return Err(ProtocolError::InternOwnership { index });
        }
        self.remote.insert(index, value.clone());
        self.inverse
            .entry(value)
            .and_modify(|indices| {
                if indices.id != index {
                    indices.extra = Some(index);
                }
            })
            .or_insert(Indices { id: index, extra: None });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inverse.is_empty()
    }

    fn send_value(&self, value: &T, index: i32) -> Result<(), ProtocolError> {
        self.core.send(|ctx, buffer| {
            value.write(ctx, buffer)?;
            buffer.write_i32(Self::wire_index(index));
            Ok(())
        })
    }

    fn resync(&self) -> Result<(), ProtocolError> {
        if !self.core.take_unsynced() {
            return Ok(());
        }
        let local: Vec<(i32, T)> = self
            .local
            .read()
            .iter()
            .enumerate()
            .filter_map(|(slot, value)| value.clone().map(|value| ((slot * 2) as i32, value)))
            .collect();
        trace!(location = %self.core.location(), len = local.len(), "resync intern root");
        for (index, value) in local {
            self.send_value(&value, index)?;
        }
        Ok(())
    }
}

impl<T: Internable> WireHandler for InternRoot<T> {
    fn on_wire_received(&self, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        let Some(protocol) = self.core.protocol() else {
            return Ok(());
        };
        let value = T::read(protocol.serialization_ctx(), buffer)?;
        let index = buffer.read_i32()?;
        if let Err(e) = self.set_interned_correspondence(index, value) {
            warn!(target: "rdsync::recv", location = %self.core.location(), index, "peer sent an index owned by this side");
            return Err(e);
        }
        Ok(())
    }
}

impl<T: Internable> RdDynamic for InternRoot<T> {
    fn protocol(&self) -> Option<Arc<Protocol>> {
        self.core.protocol()
    }

    fn location(&self) -> String {
        self.core.location()
    }
}

impl<T: Internable> RdBindable for InternRoot<T> {
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
        let protocol = self.core.bind(lifetime, parent, name, Some(handler))?;
        self.core.advise_resync(lifetime, &protocol, self.me.clone(), Self::resync);
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.core.is_bound()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
