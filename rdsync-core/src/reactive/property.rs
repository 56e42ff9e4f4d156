//! Synchronized Property
//!
//! A single value mirrored on both endpoints.
//!
//! # Master and Slave
//!
//! If both sides change the property before they have synced, one side has to
//! win. The master side numbers its changes with an increasing version and
//! ignores incoming values that carry an older version than its own; the slave
//! side always adopts what it receives, including the version. By default the
//! server endpoint is master, per property this can be overridden with
//! [`RdProperty::master`] and [`RdProperty::slave`].
//!
//! Wire message: `[i32 version][value]`.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::trace;

use crate::error::ProtocolError;
use crate::lifetime::Lifetime;
use crate::protocol::{Buffer, Identities, Protocol, RdId, WireHandler};

use super::entity::{BindCore, RdBindable, RdDynamic, Role};
use super::viewable::{Change, Source};
use super::RdValue;

/// A value synchronized between two endpoints.
///
/// # Example
///
/// ```rust,ignore
/// let name = RdProperty::new(String::new());
/// protocol.bind_root(&lifetime, "name", name.as_ref())?;
///
/// name.advise(&lifetime, |change| println!("{} ({:?})", change.event, change.origin));
/// name.set("rdsync".to_string())?;
/// ```
pub struct RdProperty<T> {
    core: Arc<BindCore>,
    me: Weak<RdProperty<T>>,
    value: RwLock<T>,
    master_version: AtomicI32,
    role: Role,
    change: Source<Change<T>>,
}

impl<T> RdProperty<T>
where
    T: RdValue + PartialEq,
{
    pub fn new(value: T) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: BindCore::new(),
            me: me.clone(),
            value: RwLock::new(value),
            master_version: AtomicI32::new(0),
            role: Role::new(),
            change: Source::new(),
        })
    }

    /// Make this side authoritative regardless of the endpoint kind.
    pub fn master(self: Arc<Self>) -> Arc<Self> {
        self.role.set_master(true);
        self
    }

    /// Make the other side authoritative regardless of the endpoint kind.
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

    pub fn value(&self) -> T {
        self.value.read().clone()
    }

    pub fn master_version(&self) -> i32 {
        self.master_version.load(Ordering::Acquire)
    }

    /// Set the value. Returns `false` without notifying or sending anything
    /// when `value` equals the current value.
    pub fn set(&self, value: T) -> Result<bool, ProtocolError> {
        self.core.local_change(|| {
            {
                let mut guard = self.value.write();
                if *guard == value {
                    return Ok(false);
                }
                *guard = value.clone();
            }

            let version = if self.is_master() {
                self.master_version.fetch_add(1, Ordering::AcqRel) + 1
            } else {
                self.master_version()
            };

            self.core.send(|ctx, buffer| {
                buffer.write_i32(version);
                value.write(ctx, buffer)
            })?;
            self.change.fire(&Change::local(value));
            Ok(true)
        })?
    }

    /// Subscribe to changes. The current value is not replayed.
    pub fn advise<F>(&self, lifetime: &Lifetime, handler: F)
    where
        F: Fn(&Change<T>) + Send + Sync + 'static,
    {
        self.change.advise(lifetime, handler);
    }

    /// Subscribe to the value: `handler` sees the current value right away,
    /// then every change.
    pub fn view<F>(&self, lifetime: &Lifetime, handler: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        if !lifetime.is_alive() {
            return;
        }
        handler(&self.value());
        self.change.advise(lifetime, move |change| handler(&change.event));
    }

    fn resync(&self) -> Result<(), ProtocolError> {
        if !self.core.take_unsynced() {
            return Ok(());
        }
        let value = self.value();
        let version = self.master_version();
        trace!(location = %self.core.location(), version, "resync property");
        self.core.send(|ctx, buffer| {
            buffer.write_i32(version);
            value.write(ctx, buffer)
        })
    }
}

impl<T> WireHandler for RdProperty<T>
where
    T: RdValue + PartialEq,
{
    fn on_wire_received(&self, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        let Some(protocol) = self.core.protocol() else {
            return Ok(());
        };
        let version = buffer.read_i32()?;
        let value = T::read(protocol.serialization_ctx(), buffer)?;

        if self.is_master() && version < self.master_version() {
            trace!(
                target: "rdsync::recv",
                location = %self.core.location(),
                version,
                own = self.master_version(),
                "stale value from slave rejected"
            );
            return Ok(());
        }

        self.master_version.store(version, Ordering::Release);
        self.core.clear_unsynced();

        {
            let mut guard = self.value.write();
            if *guard == value {
                return Ok(());
            }
            *guard = value.clone();
        }
        self.change.fire(&Change::remote(value));
        Ok(())
    }
}

impl<T> RdDynamic for RdProperty<T>
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

impl<T> RdBindable for RdProperty<T>
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

impl<T> Debug for RdProperty<T>
where
    T: RdValue + PartialEq + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdProperty")
            .field("location", &self.core.location())
            .field("value", &*self.value.read())
            .field("master_version", &self.master_version())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn unbound_property_is_a_local_value() {
        let property = RdProperty::new(1);
        assert!(property.set(2).unwrap());
        assert_eq!(property.value(), 2);
        assert!(!property.is_bound());
    }

    #[test]
    fn equal_set_is_a_no_op() {
        let property = RdProperty::new(3);
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        property.advise(&Lifetime::eternal(), move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!property.set(3).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(property.set(4).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_from_listener_is_reentrant() {
        let property = RdProperty::new(0);
        let result = Arc::new(parking_lot::Mutex::new(None));
        let lifetime = Lifetime::new();

        let (weak, result_clone) = (Arc::downgrade(&property), result.clone());
        property.advise(&lifetime, move |_| {
            if let Some(property) = weak.upgrade() {
                *result_clone.lock() = Some(property.set(100));
            }
        });

        property.set(1).unwrap();
        assert!(matches!(*result.lock(), Some(Err(ProtocolError::ReentrantLocalChange { .. }))));
        assert_eq!(property.value(), 1);
        lifetime.terminate().unwrap();
    }

    #[test]
    fn explicit_master_versions_local_changes() {
        let property = RdProperty::new(0).master();
        property.set(1).unwrap();
        property.set(2).unwrap();
        assert_eq!(property.master_version(), 2);

        let slave = RdProperty::new(0).slave();
        slave.set(1).unwrap();
        assert_eq!(slave.master_version(), 0);
    }

    #[test]
    fn view_replays_current_value() {
        let property = RdProperty::new(7);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        property.view(&Lifetime::eternal(), move |v| seen_clone.lock().push(*v));

        property.set(8).unwrap();
        assert_eq!(*seen.lock(), vec![7, 8]);
    }
}
