//! Synchronized List
//!
//! Positional list mirrored on both endpoints:
//!
//! ```text
//!   Add      [u8 op][i32 version][i32 index][value]    insert at index
//!   Update   [u8 op][i32 version][i32 index][value]    replace at index
//!   Remove   [u8 op][i32 version][i32 index]
//!   Clear    [u8 op][i32 version]
//! ```
//!
//! Indices are only meaningful against the sender's list at the time of the
//! change, so a list that missed changes while disconnected cannot resend
//! individual records. Its resync is a `Clear` followed by one `Add` per
//! element, in order.
//!
//! # Conflicts
//!
//! Index-based changes from both sides cannot be merged, so the master's
//! contents win. The master counts its changes in `version`; the slave stamps
//! its records with the last master version it saw. A slave record older than
//! the master's version was made against contents the master no longer has:
//! the master drops it and resyncs its whole list, which the slave adopts.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::trace;

use crate::error::{BufferError, ProtocolError};
use crate::lifetime::Lifetime;
use crate::protocol::{Buffer, Identities, Protocol, RdId, WireHandler};

use super::entity::{BindCore, RdBindable, RdDynamic, Role};
use super::op::{ListEvent, OpKind};
use super::viewable::{Change, Source};
use super::RdValue;

pub struct RdList<T> {
    core: Arc<BindCore>,
    me: Weak<RdList<T>>,
    items: RwLock<Vec<T>>,
    version: AtomicI32,
    role: Role,
    change: Source<Change<ListEvent<T>>>,
}

impl<T> RdList<T>
where
    T: RdValue + PartialEq,
{
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: BindCore::new(),
            me: me.clone(),
            items: RwLock::new(Vec::new()),
            version: AtomicI32::new(0),
            role: Role::new(),
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

    pub fn is_master(&self) -> bool {
        self.role.is_master(&self.core)
    }

    pub fn version(&self) -> i32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn make_async(self: Arc<Self>) -> Arc<Self> {
        self.core.set_async(true);
        self
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.items.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.items.read().clone()
    }

    /// Append `value`.
    pub fn add(&self, value: T) -> Result<(), ProtocolError> {
        self.core.local_change(|| {
            let index = {
                let mut items = self.items.write();
                items.push(value.clone());
                items.len() - 1
            };
            self.send_op(OpKind::Add, index, Some(&value))?;
            self.change.fire(&Change::local(ListEvent::Add { index, value }));
            Ok(())
        })?
    }

    /// Insert `value` at `index`, shifting later elements.
    pub fn insert(&self, index: usize, value: T) -> Result<(), ProtocolError> {
        self.core.local_change(|| {
            {
                let mut items = self.items.write();
                if index > items.len() {
                    return Err(self.index_error(index, items.len()));
                }
                items.insert(index, value.clone());
            }
            self.send_op(OpKind::Add, index, Some(&value))?;
            self.change.fire(&Change::local(ListEvent::Add { index, value }));
            Ok(())
        })?
    }

    /// Replace the element at `index`, returning the old one. Setting an
    /// equal value changes nothing.
    pub fn set(&self, index: usize, value: T) -> Result<T, ProtocolError> {
        self.core.local_change(|| {
            let old = {
                let mut items = self.items.write();
                let len = items.len();
                let slot = items.get_mut(index).ok_or_else(|| self.index_error(index, len))?;
                if *slot == value {
                    return Ok(value);
                }
                std::mem::replace(slot, value.clone())
            };
            self.send_op(OpKind::Update, index, Some(&value))?;
            self.change.fire(&Change::local(ListEvent::Update { index, old: old.clone(), new: value }));
            Ok(old)
        })?
    }

    pub fn remove_at(&self, index: usize) -> Result<T, ProtocolError> {
        self.core.local_change(|| {
            let value = {
                let mut items = self.items.write();
                if index >= items.len() {
                    return Err(self.index_error(index, items.len()));
                }
                items.remove(index)
            };
            self.send_op(OpKind::Remove, index, None)?;
            self.change.fire(&Change::local(ListEvent::Remove { index, value: value.clone() }));
            Ok(value)
        })?
    }

    /// Remove the first element equal to `value`. Returns `false` if there is
    /// none.
    pub fn remove(&self, value: &T) -> Result<bool, ProtocolError> {
        let position = self.items.read().iter().position(|item| item == value);
        match position {
            Some(index) => self.remove_at(index).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn clear(&self) -> Result<(), ProtocolError> {
        self.core.local_change(|| {
            let removed = std::mem::take(&mut *self.items.write());
            if removed.is_empty() {
                return Ok(());
            }
            let version = self.next_version();
            self.core.send(|_, buffer| {
                OpKind::Clear.write(buffer);
                buffer.write_i32(version);
                Ok(())
            })?;
            self.fire_cleared(removed, Change::local);
            Ok(())
        })?
    }

    pub fn advise<F>(&self, lifetime: &Lifetime, handler: F)
    where
        F: Fn(&Change<ListEvent<T>>) + Send + Sync + 'static,
    {
        self.change.advise(lifetime, handler);
    }

    fn index_error(&self, index: usize, len: usize) -> ProtocolError {
        ProtocolError::ListIndex { location: self.core.location(), index: index as i32, len }
    }

    /// Version to stamp a local change with.
    fn next_version(&self) -> i32 {
        if self.is_master() {
            self.version.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.version()
        }
    }

    fn send_op(&self, kind: OpKind, index: usize, value: Option<&T>) -> Result<(), ProtocolError> {
        let version = self.next_version();
        self.send_record(kind, version, index, value)
    }

    fn send_record(&self, kind: OpKind, version: i32, index: usize, value: Option<&T>) -> Result<(), ProtocolError> {
        self.core.send(|ctx, buffer| {
            kind.write(buffer);
            buffer.write_i32(version);
            buffer.write_i32(index as i32);
            match value {
                Some(value) => value.write(ctx, buffer),
                None => Ok(()),
            }
        })
    }

    // Removals are reported from the back so every index is valid at the
    // moment its event fires.
    fn fire_cleared(&self, removed: Vec<T>, wrap: fn(ListEvent<T>) -> Change<ListEvent<T>>) {
        for (index, value) in removed.into_iter().enumerate().rev() {
            self.change.fire(&wrap(ListEvent::Remove { index, value }));
        }
    }

    fn resync(&self) -> Result<(), ProtocolError> {
        if !self.core.take_unsynced() {
            return Ok(());
        }
        let items = self.snapshot();
        let version = self.version();
        trace!(location = %self.core.location(), len = items.len(), version, "resync list");
        self.core.send(|_, buffer| {
            OpKind::Clear.write(buffer);
            buffer.write_i32(version);
            Ok(())
        })?;
        for (index, value) in items.iter().enumerate() {
            self.send_record(OpKind::Add, version, index, Some(value))?;
        }
        Ok(())
    }

    fn read_index(&self, buffer: &mut Buffer, len: usize, inclusive: bool) -> Result<usize, ProtocolError> {
        let raw = buffer.read_i32()?;
        let limit = if inclusive { len + 1 } else { len };
        match usize::try_from(raw) {
            Ok(index) if index < limit => Ok(index),
            _ => Err(ProtocolError::ListIndex { location: self.core.location(), index: raw, len }),
        }
    }
}

impl<T> WireHandler for RdList<T>
where
    T: RdValue + PartialEq,
{
    fn on_wire_received(&self, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        let Some(protocol) = self.core.protocol() else {
            return Ok(());
        };
        let ctx = protocol.serialization_ctx();

        let kind = OpKind::read(buffer)?;
        let version = buffer.read_i32()?;
        if self.is_master() {
            if version < self.version() {
                trace!(
                    target: "rdsync::recv",
                    location = %self.core.location(),
                    version,
                    own = self.version(),
                    "stale change from slave rejected"
                );
                if self.core.mark_unsynced() {
                    self.core.queue_resync(self.me.clone(), Self::resync);
                }
                return Ok(());
            }
        } else {
            self.version.store(version, Ordering::Release);
            self.core.clear_unsynced();
        }

        let event = match kind {
            OpKind::Add => {
                let index = self.read_index(buffer, self.len(), true)?;
                let value = T::read(ctx, buffer)?;
                self.items.write().insert(index, value.clone());
                ListEvent::Add { index, value }
            }
            OpKind::Update => {
                let index = self.read_index(buffer, self.len(), false)?;
                let value = T::read(ctx, buffer)?;
                let old = {
                    let mut items = self.items.write();
                    if items[index] == value {
                        return Ok(());
                    }
                    std::mem::replace(&mut items[index], value.clone())
                };
                ListEvent::Update { index, old, new: value }
            }
            OpKind::Remove => {
                let index = self.read_index(buffer, self.len(), false)?;
                let value = self.items.write().remove(index);
                ListEvent::Remove { index, value }
            }
            OpKind::Clear => {
                let removed = std::mem::take(&mut *self.items.write());
                self.fire_cleared(removed, Change::remote);
                return Ok(());
            }
            OpKind::Ack => {
                return Err(BufferError::InvalidTag { kind: "list op", tag: OpKind::Ack as i64 }.into());
            }
        };
        self.change.fire(&Change::remote(event));
        Ok(())
    }
}

impl<T> RdDynamic for RdList<T>
where
    T: RdValue + PartialEq,
{
    fn protocol(&self) -> Option<Arc<Protocol>> {
        self.core.protocol()
    }

    fn location(&self) -> String {
        self.core.location()
    }
}

impl<T> RdBindable for RdList<T>
where
    T: RdValue + PartialEq,
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

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn positional_operations() {
        let list = RdList::<String>::new();
        list.add("a".into()).unwrap();
        list.add("c".into()).unwrap();
        list.insert(1, "b".into()).unwrap();
        assert_eq!(list.snapshot(), vec!["a", "b", "c"]);

        assert_eq!(list.set(0, "z".into()).unwrap(), "a");
        assert_eq!(list.remove_at(1).unwrap(), "b");
        assert!(list.remove(&"c".to_string()).unwrap());
        assert!(!list.remove(&"c".to_string()).unwrap());
        assert_eq!(list.snapshot(), vec!["z"]);
    }

    #[test]
    fn out_of_range_index_fails() {
        let list = RdList::<i32>::new();
        list.add(1).unwrap();

        assert!(matches!(list.insert(3, 2), Err(ProtocolError::ListIndex { index: 3, len: 1, .. })));
        assert!(matches!(list.set(1, 2), Err(ProtocolError::ListIndex { .. })));
        assert!(matches!(list.remove_at(1), Err(ProtocolError::ListIndex { .. })));
        assert_eq!(list.snapshot(), vec![1]);
    }

    #[test]
    fn clear_reports_removals_from_the_back() {
        let list = RdList::<String>::new();
        for value in ["x", "y"] {
            list.add(value.to_string()).unwrap();
        }
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        list.advise(&Lifetime::eternal(), move |change| events_clone.lock().push(change.event.clone()));

        list.clear().unwrap();
        assert_eq!(
            *events.lock(),
            vec![
                ListEvent::Remove { index: 1, value: "y".to_string() },
                ListEvent::Remove { index: 0, value: "x".to_string() },
            ]
        );
    }

    #[test]
    fn only_the_master_counts_versions() {
        let slave = RdList::<i32>::new();
        slave.add(1).unwrap();
        slave.clear().unwrap();
        assert_eq!(slave.version(), 0);

        let master = RdList::<i32>::new().master();
        master.add(1).unwrap();
        master.set(0, 2).unwrap();
        master.clear().unwrap();
        assert_eq!(master.version(), 3);
    }

    #[test]
    fn equal_set_is_a_no_op() {
        let list = RdList::<i32>::new();
        list.add(4).unwrap();
        let seen = Arc::new(Mutex::new(0));
        let seen_clone = seen.clone();
        list.advise(&Lifetime::eternal(), move |_| *seen_clone.lock() += 1);

        assert_eq!(list.set(0, 4).unwrap(), 4);
        assert_eq!(*seen.lock(), 0);
    }
}
