//! Local Viewables
//!
//! In-process observable values with lifetime-scoped subscriptions. These are
//! the building blocks the synchronized entities use to notify local code;
//! they know nothing about the wire.
//!
//! # How Subscriptions Work
//!
//! 1. `advise(lifetime, handler)` stores the handler under a fresh
//!    [`SubscriberId`] and attaches its removal to `lifetime`.
//!
//! 2. `fire(event)` snapshots the handler list and calls each handler with
//!    the lock released, so handlers may subscribe or unsubscribe freely.
//!
//! 3. Terminating the lifetime removes the handler. Advising with a lifetime
//!    that is no longer alive does nothing.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::lifetime::Lifetime;

/// Unique identifier of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Produced by a mutation on this endpoint.
    Local,
    /// Applied from a message received over the wire.
    Remote,
}

impl Origin {
    pub fn is_local(self) -> bool {
        self == Origin::Local
    }
}

/// A change notification: the event and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<E> {
    pub event: E,
    pub origin: Origin,
}

impl<E> Change<E> {
    pub fn local(event: E) -> Self {
        Self { event, origin: Origin::Local }
    }

    pub fn remote(event: E) -> Self {
        Self { event, origin: Origin::Remote }
    }

    pub fn is_local(&self) -> bool {
        self.origin.is_local()
    }
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Handlers<E> = RwLock<Vec<(SubscriberId, Handler<E>)>>;

/// A stream of events with lifetime-scoped subscribers.
pub struct Source<E> {
    handlers: Arc<Handlers<E>>,
}

impl<E: 'static> Source<E> {
    pub fn new() -> Self {
        Self { handlers: Arc::new(RwLock::new(Vec::new())) }
    }

    /// Subscribe `handler` for as long as `lifetime` is alive.
    pub fn advise<F>(&self, lifetime: &Lifetime, handler: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        if !lifetime.is_alive() {
            return;
        }

        let id = SubscriberId::new();
        self.handlers.write().push((id, Arc::new(handler)));

        let handlers: Weak<Handlers<E>> = Arc::downgrade(&self.handlers);
        let remove = move || {
            if let Some(handlers) = handlers.upgrade() {
                handlers.write().retain(|(sid, _)| *sid != id);
            }
        };
        if lifetime.attach(remove).is_err() {
            // lost the race with termination
            self.handlers.write().retain(|(sid, _)| *sid != id);
        }
    }

    /// Call every current subscriber with `event`.
    pub fn fire(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self.handlers.read().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl<E: 'static> Default for Source<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A local observable value.
///
/// Advising calls the handler with the current value right away and then on
/// every change. Setting an equal value does nothing.
pub struct ViewableProperty<T> {
    value: RwLock<T>,
    change: Source<T>,
}

impl<T> ViewableProperty<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Self { value: RwLock::new(value), change: Source::new() }
    }

    pub fn value(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value and notify subscribers. Returns `false` when the
    /// value was already equal.
    pub fn set(&self, value: T) -> bool {
        {
            let mut guard = self.value.write();
            if *guard == value {
                return false;
            }
            *guard = value.clone();
        }
        self.change.fire(&value);
        true
    }

    pub fn advise<F>(&self, lifetime: &Lifetime, handler: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        if !lifetime.is_alive() {
            return;
        }
        handler(&self.value());
        self.change.advise(lifetime, handler);
    }
}

impl<T> Debug for ViewableProperty<T>
where
    T: Clone + PartialEq + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewableProperty")
            .field("value", &*self.value.read())
            .field("subscriber_count", &self.change.subscriber_count())
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
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn source_notifies_until_lifetime_ends() {
        let source = Source::<i32>::new();
        let sum = Arc::new(AtomicI32::new(0));
        let lifetime = Lifetime::new();

        let sum_clone = sum.clone();
        source.advise(&lifetime, move |v| {
            sum_clone.fetch_add(*v, Ordering::SeqCst);
        });

        source.fire(&2);
        source.fire(&3);
        assert_eq!(sum.load(Ordering::SeqCst), 5);

        lifetime.terminate().unwrap();
        source.fire(&10);
        assert_eq!(sum.load(Ordering::SeqCst), 5);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn advise_on_terminated_lifetime_is_ignored() {
        let source = Source::<i32>::new();
        source.advise(&Lifetime::terminated(), |_| panic!("must not be called"));
        source.fire(&1);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn handler_may_subscribe_during_fire() {
        let source = Arc::new(Source::<i32>::new());
        let lifetime = Lifetime::new();
        let calls = Arc::new(AtomicI32::new(0));

        let (source_clone, lifetime_clone, calls_clone) = (source.clone(), lifetime.clone(), calls.clone());
        source.advise(&lifetime, move |_| {
            let calls = calls_clone.clone();
            source_clone.advise(&lifetime_clone, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        });

        source.fire(&1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        source.fire(&2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn property_advise_sees_current_value_and_changes() {
        let property = ViewableProperty::new(1);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let lifetime = Lifetime::new();

        let seen_clone = seen.clone();
        property.advise(&lifetime, move |v| seen_clone.lock().push(*v));

        assert!(property.set(2));
        assert!(!property.set(2));
        assert!(property.set(3));

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }
}
