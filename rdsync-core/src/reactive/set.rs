//! Synchronized Set
//!
//! Insertion-ordered set mirrored on both endpoints. Records are
//! `[header][value]` for `Add` and `Remove`, a bare `[header]` for `Clear`
//! and `Ack`. Conflicting offline changes of the same element are resolved
//! the way the map resolves them per key: the master wins.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use parking_lot::RwLock;
use tracing::{error, trace};

use crate::error::{BufferError, ProtocolError};
use crate::lifetime::Lifetime;
use crate::protocol::{Buffer, Identities, Protocol, RdId, WireHandler};

use super::entity::{BindCore, RdBindable, RdDynamic, Role};
use super::keyed::KeyVersions;
use super::op::{OpKind, RecordHeader, SetEvent};
use super::viewable::{Change, Source};
use super::RdValue;

pub struct RdSet<T> {
    core: Arc<BindCore>,
    me: Weak<RdSet<T>>,
    items: RwLock<IndexSet<T>>,
    role: Role,
    versions: KeyVersions<T>,
    change: Source<Change<SetEvent<T>>>,
}

impl<T> RdSet<T>
where
    T: RdValue + Eq + Hash,
{
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: BindCore::new(),
            me: me.clone(),
            items: RwLock::new(IndexSet::new()),
            role: Role::new(),
            versions: KeyVersions::new(),
            change: Source::new(),
        })
    }

    pub fn master(self: Arc<Self>) -> Arc<Self> {
        self.role.set_master(true);
        self
    }

    pub fn slave(self: Arc<Self>) -> Arc<Self> {
        self.role.set_master(false);
        self
    }

    pub fn make_async(self: Arc<Self>) -> Arc<Self> {
        self.core.set_async(true);
        self
    }

    pub fn is_master(&self) -> bool {
        self.role.is_master(&self.core)
    }

    pub fn contains(&self, value: &T) -> bool {
        self.items.read().contains(value)
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn snapshot(&self) -> IndexSet<T> {
        self.items.read().clone()
    }

    /// Returns `false` if `value` was already present.
    pub fn add(&self, value: T) -> Result<bool, ProtocolError> {
        self.core.local_change(|| {
            if !self.items.write().insert(value.clone()) {
                return Ok(false);
            }
            self.publish(OpKind::Add, &value)?;
            self.change.fire(&Change::local(SetEvent::Add(value)));
            Ok(true)
        })?
    }

    /// Returns `false` if `value` was absent.
    pub fn remove(&self, value: &T) -> Result<bool, ProtocolError> {
        self.core.local_change(|| {
            let Some(value) = self.items.write().shift_take(value) else {
                return Ok(false);
            };
            self.publish(OpKind::Remove, &value)?;
            self.change.fire(&Change::local(SetEvent::Remove(value)));
            Ok(true)
        })?
    }

    pub fn clear(&self) -> Result<(), ProtocolError> {
        self.core.local_change(|| {
            let removed = std::mem::take(&mut *self.items.write());
            if removed.is_empty() {
                return Ok(());
            }

            let header = RecordHeader::new(OpKind::Clear, self.versions.stamp(self.is_master(), &removed));
            let sent = self.core.try_send(|_, buffer| {
                header.write(buffer);
                Ok(())
            })?;
            if !sent {
                self.versions.mark_unsent(removed.iter().cloned());
            }
            for value in removed {
                self.change.fire(&Change::local(SetEvent::Remove(value)));
            }
            Ok(())
        })?
    }

    pub fn advise<F>(&self, lifetime: &Lifetime, handler: F)
    where
        F: Fn(&Change<SetEvent<T>>) + Send + Sync + 'static,
    {
        self.change.advise(lifetime, handler);
    }

    fn publish(&self, kind: OpKind, value: &T) -> Result<(), ProtocolError> {
        let header = RecordHeader::new(kind, self.versions.stamp(self.is_master(), [value]));
        let sent = self.core.try_send(|ctx, buffer| {
            header.write(buffer);
            value.write(ctx, buffer)
        })?;
        if !sent {
            self.versions.mark_unsent([value.clone()]);
        }
        Ok(())
    }

    fn resync(&self) -> Result<(), ProtocolError> {
        self.core.clear_unsynced();
        let values = self.versions.take_resync_keys();
        if values.is_empty() {
            return Ok(());
        }
        trace!(location = %self.core.location(), len = values.len(), "resync set");
        for value in values {
            let kind = if self.contains(&value) { OpKind::Add } else { OpKind::Remove };
            self.publish(kind, &value)?;
        }
        Ok(())
    }
}

impl<T> WireHandler for RdSet<T>
where
    T: RdValue + Eq + Hash,
{
    fn on_wire_received(&self, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        let Some(protocol) = self.core.protocol() else {
            return Ok(());
        };
        let master = self.is_master();
        let header = RecordHeader::read(buffer)?;

        match header.kind {
            OpKind::Ack => {
                let version = header.version.unwrap_or_default();
                if master && self.versions.acknowledge(version) {
                    trace!(target: "rdsync::recv", location = %self.core.location(), version, "ack");
                } else {
                    error!(target: "rdsync::recv", location = %self.core.location(), version, master, "unexpected ack");
                }
                return Ok(());
            }
            OpKind::Update => {
                return Err(BufferError::InvalidTag { kind: "set op", tag: OpKind::Update as i64 }.into());
            }
            OpKind::Clear => {
                let removed: Vec<T> = {
                    let mut items = self.items.write();
                    let values: Vec<T> =
                        items.iter().filter(|value| self.versions.accepts(master, value, header.version)).cloned().collect();
                    values.iter().filter_map(|value| items.shift_take(value)).collect()
                };
                if header.version.is_some() {
                    self.versions.all_superseded();
                }
                for value in removed {
                    self.change.fire(&Change::remote(SetEvent::Remove(value)));
                }
            }
            OpKind::Add | OpKind::Remove => {
                let value = T::read(protocol.serialization_ctx(), buffer)?;
                if !self.versions.accepts(master, &value, header.version) {
                    trace!(target: "rdsync::recv", location = %self.core.location(), "change of pending element rejected");
                    return Ok(());
                }
                if header.version.is_some() {
                    self.versions.superseded(&value);
                }
                if header.kind == OpKind::Add {
                    if self.items.write().insert(value.clone()) {
                        self.change.fire(&Change::remote(SetEvent::Add(value)));
                    }
                } else {
                    let removed = self.items.write().shift_take(&value);
                    if let Some(removed) = removed {
                        self.change.fire(&Change::remote(SetEvent::Remove(removed)));
                    }
                }
            }
        }

        if let Some(version) = header.version {
            if master {
                error!(location = %self.core.location(), "both ends are masters");
            }
            self.core.send(|_, buffer| {
                RecordHeader::new(OpKind::Ack, Some(version)).write(buffer);
                Ok(())
            })?;
        }
        Ok(())
    }
}

impl<T> RdDynamic for RdSet<T>
where
    T: RdValue + Eq + Hash,
{
    fn protocol(&self) -> Option<Arc<Protocol>> {
        self.core.protocol()
    }

    fn location(&self) -> String {
        self.core.location()
    }
}

impl<T> RdBindable for RdSet<T>
where
    T: RdValue + Eq + Hash,
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
        let protocol = self.core.bind(lifetime, parent, name, Some(handler))?;
        self.core.advise_resync(lifetime, &protocol, self.me.clone(), Self::resync);
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.core.is_bound()
    }
}
