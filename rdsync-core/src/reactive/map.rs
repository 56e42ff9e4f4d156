//! Synchronized Map
//!
//! Insertion-ordered map mirrored on both endpoints. Each mutation is sent as
//! one record for one key:
//!
//! ```text
//!   Add | Update   [header][key][value]
//!   Remove         [header][key]
//!   Clear          [header]
//!   Ack            [header]
//! ```
//!
//! The header is the op kind, plus a version when the master sent the record
//! (see `RecordHeader`). An `Ack` always carries the version it acknowledges.
//!
//! Putting an equal value and removing an absent key are no-ops that neither
//! notify nor send.
//!
//! # Conflicts
//!
//! When both sides change the same key before they sync, the master's change
//! wins: the slave applies and acknowledges it, the master ignores the slave's
//! change until that acknowledgement arrives. Changes of different keys merge.
//! After a reconnect each side sends the current state of every key it could
//! not send, so offline removals reach the peer as well.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{error, trace};

use crate::error::ProtocolError;
use crate::lifetime::Lifetime;
use crate::protocol::{Buffer, Identities, Protocol, RdId, WireHandler};

use super::entity::{BindCore, RdBindable, RdDynamic, Role};
use super::keyed::KeyVersions;
use super::op::{MapEvent, OpKind, RecordHeader};
use super::viewable::{Change, Source};
use super::RdValue;

/// A key-value map synchronized between two endpoints.
pub struct RdMap<K, V> {
    core: Arc<BindCore>,
    me: Weak<RdMap<K, V>>,
    entries: RwLock<IndexMap<K, V>>,
    role: Role,
    versions: KeyVersions<K>,
    change: Source<Change<MapEvent<K, V>>>,
}

impl<K, V> RdMap<K, V>
where
    K: RdValue + Eq + Hash,
    V: RdValue + PartialEq,
{
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: BindCore::new(),
            me: me.clone(),
            entries: RwLock::new(IndexMap::new()),
            role: Role::new(),
            versions: KeyVersions::new(),
            change: Source::new(),
        })
    }

    /// Make this side win conflicts regardless of the endpoint kind.
    pub fn master(self: Arc<Self>) -> Arc<Self> {
        self.role.set_master(true);
        self
    }

    /// Make the other side win conflicts regardless of the endpoint kind.
    pub fn slave(self: Arc<Self>) -> Arc<Self> {
        self.role.set_master(false);
        self
    }

    /// Allow changes from any thread while bound.
    pub fn make_async(self: Arc<Self>) -> Arc<Self> {
        self.core.set_async(true);
        self
    }

    pub fn is_master(&self) -> bool {
        self.role.is_master(&self.core)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of the current entries in insertion order.
    pub fn snapshot(&self) -> IndexMap<K, V> {
        self.entries.read().clone()
    }

    /// Insert or replace. Returns the previous value.
    pub fn put(&self, key: K, value: V) -> Result<Option<V>, ProtocolError> {
        self.core.local_change(|| {
            let old = {
                let mut entries = self.entries.write();
                if entries.get(&key) == Some(&value) {
                    return Ok(Some(value));
                }
                entries.insert(key.clone(), value.clone())
            };

            let kind = if old.is_some() { OpKind::Update } else { OpKind::Add };
            self.publish(kind, &key, Some(&value))?;

            let event = match old.clone() {
                Some(old) => MapEvent::Update { key, old, new: value },
                None => MapEvent::Add { key, value },
            };
            self.change.fire(&Change::local(event));
            Ok(old)
        })?
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>, ProtocolError> {
        self.core.local_change(|| {
            let Some(value) = self.entries.write().shift_remove(key) else {
                return Ok(None);
            };

            self.publish(OpKind::Remove, key, None)?;
            self.change.fire(&Change::local(MapEvent::Remove { key: key.clone(), value: value.clone() }));
            Ok(Some(value))
        })?
    }

    pub fn clear(&self) -> Result<(), ProtocolError> {
        self.core.local_change(|| {
            let removed = std::mem::take(&mut *self.entries.write());
            if removed.is_empty() {
                return Ok(());
            }

            let header = RecordHeader::new(OpKind::Clear, self.versions.stamp(self.is_master(), removed.keys()));
            let sent = self.core.try_send(|_, buffer| {
                header.write(buffer);
                Ok(())
            })?;
            if !sent {
                self.versions.mark_unsent(removed.keys().cloned());
            }
            for (key, value) in removed {
                self.change.fire(&Change::local(MapEvent::Remove { key, value }));
            }
            Ok(())
        })?
    }

    /// Subscribe to changes. Existing entries are not replayed.
    pub fn advise<F>(&self, lifetime: &Lifetime, handler: F)
    where
        F: Fn(&Change<MapEvent<K, V>>) + Send + Sync + 'static,
    {
        self.change.advise(lifetime, handler);
    }

    /// Subscribe to changes after replaying every existing entry as a local
    /// `Add`.
    pub fn view<F>(&self, lifetime: &Lifetime, handler: F)
    where
        F: Fn(&Change<MapEvent<K, V>>) + Send + Sync + 'static,
    {
        if !lifetime.is_alive() {
            return;
        }
        for (key, value) in self.snapshot() {
            handler(&Change::local(MapEvent::Add { key, value }));
        }
        self.change.advise(lifetime, handler);
    }

    /// Send one change of `key`, stamped if this side is master. A change
    /// that cannot be sent now is sent on the next resync.
    fn publish(&self, kind: OpKind, key: &K, value: Option<&V>) -> Result<(), ProtocolError> {
        let header = RecordHeader::new(kind, self.versions.stamp(self.is_master(), [key]));
        let sent = self.core.try_send(|ctx, buffer| {
            header.write(buffer);
            key.write(ctx, buffer)?;
            match value {
                Some(value) => value.write(ctx, buffer),
                None => Ok(()),
            }
        })?;
        if !sent {
            self.versions.mark_unsent([key.clone()]);
        }
        Ok(())
    }

    fn resync(&self) -> Result<(), ProtocolError> {
        self.core.clear_unsynced();
        let keys = self.versions.take_resync_keys();
        if keys.is_empty() {
            return Ok(());
        }
        trace!(location = %self.core.location(), keys = keys.len(), "resync map");
        for key in keys {
            match self.get(&key) {
                Some(value) => self.publish(OpKind::Add, &key, Some(&value))?,
                None => self.publish(OpKind::Remove, &key, None)?,
            }
        }
        Ok(())
    }

    fn apply_put(&self, key: K, value: V) {
        let old = {
            let mut entries = self.entries.write();
            if entries.get(&key) == Some(&value) {
                return;
            }
            entries.insert(key.clone(), value.clone())
        };
        let event = match old {
            Some(old) => MapEvent::Update { key, old, new: value },
            None => MapEvent::Add { key, value },
        };
        self.change.fire(&Change::remote(event));
    }

    fn apply_remove(&self, key: K) {
        let removed = self.entries.write().shift_remove(&key);
        if let Some(value) = removed {
            self.change.fire(&Change::remote(MapEvent::Remove { key, value }));
        }
    }

    /// Remove every entry the record may touch. A master keeps its pending
    /// keys when the clear comes from the slave.
    fn apply_clear(&self, master: bool, version: Option<i64>) {
        let removed: Vec<(K, V)> = {
            let mut entries = self.entries.write();
            let keys: Vec<K> =
                entries.keys().filter(|key| self.versions.accepts(master, key, version)).cloned().collect();
            keys.iter().filter_map(|key| entries.shift_remove_entry(key)).collect()
        };
        for (key, value) in removed {
            self.change.fire(&Change::remote(MapEvent::Remove { key, value }));
        }
    }
}

impl<K, V> WireHandler for RdMap<K, V>
where
    K: RdValue + Eq + Hash,
    V: RdValue + PartialEq,
{
    fn on_wire_received(&self, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        let Some(protocol) = self.core.protocol() else {
            return Ok(());
        };
        let ctx = protocol.serialization_ctx();
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
            OpKind::Clear => {
                self.apply_clear(master, header.version);
                if header.version.is_some() {
                    self.versions.all_superseded();
                }
            }
            OpKind::Add | OpKind::Update | OpKind::Remove => {
                let key = K::read(ctx, buffer)?;
                let value = match header.kind {
                    OpKind::Remove => None,
                    _ => Some(V::read(ctx, buffer)?),
                };
                if !self.versions.accepts(master, &key, header.version) {
                    trace!(target: "rdsync::recv", location = %self.core.location(), "change of pending key rejected");
                    return Ok(());
                }
                if header.version.is_some() {
                    self.versions.superseded(&key);
                }
                match value {
                    Some(value) => self.apply_put(key, value),
                    None => self.apply_remove(key),
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

impl<K, V> RdDynamic for RdMap<K, V>
where
    K: RdValue + Eq + Hash,
    V: RdValue + PartialEq,
{
    fn protocol(&self) -> Option<Arc<Protocol>> {
        self.core.protocol()
    }

    fn location(&self) -> String {
        self.core.location()
    }
}

impl<K, V> RdBindable for RdMap<K, V>
where
    K: RdValue + Eq + Hash,
    V: RdValue + PartialEq,
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

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
