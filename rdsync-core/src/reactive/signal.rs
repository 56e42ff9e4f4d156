//! Synchronized Signal
//!
//! A stateless event stream. `fire` notifies local subscribers and sends the
//! value to the other side, where it is fired with [`Origin::Remote`]. Nothing
//! is stored, late subscribers see only later events.
//!
//! [`Origin::Remote`]: super::Origin::Remote

use std::sync::{Arc, Weak};

use crate::error::ProtocolError;
use crate::lifetime::Lifetime;
use crate::protocol::{Buffer, Identities, Protocol, RdId, WireHandler};

use super::entity::{BindCore, RdBindable, RdDynamic};
use super::viewable::{Change, Source};
use super::RdValue;

/// An event stream synchronized between two endpoints.
pub struct RdSignal<T> {
    core: Arc<BindCore>,
    me: Weak<RdSignal<T>>,
    source: Source<Change<T>>,
}

impl<T: RdValue> RdSignal<T> {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self { core: BindCore::new(), me: me.clone(), source: Source::new() })
    }

    /// Allow firing from any thread while bound.
    pub fn make_async(self: Arc<Self>) -> Arc<Self> {
        self.core.set_async(true);
        self
    }

    /// Send `value` and notify local subscribers.
    pub fn fire(&self, value: T) -> Result<(), ProtocolError> {
        self.core.local_change(|| {
            self.core.send(|ctx, buffer| value.write(ctx, buffer))?;
            self.source.fire(&Change::local(value));
            Ok(())
        })?
    }

    pub fn advise<F>(&self, lifetime: &Lifetime, handler: F)
    where
        F: Fn(&Change<T>) + Send + Sync + 'static,
    {
        self.source.advise(lifetime, handler);
    }
}

impl<T: RdValue> WireHandler for RdSignal<T> {
    fn on_wire_received(&self, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        let Some(protocol) = self.core.protocol() else {
            return Ok(());
        };
        let value = T::read(protocol.serialization_ctx(), buffer)?;
        self.source.fire(&Change::remote(value));
        Ok(())
    }
}

impl<T: RdValue> RdDynamic for RdSignal<T> {
    fn protocol(&self) -> Option<Arc<Protocol>> {
        self.core.protocol()
    }

    fn location(&self) -> String {
        self.core.location()
    }
}

impl<T: RdValue> RdBindable for RdSignal<T> {
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
