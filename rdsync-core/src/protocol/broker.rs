//! Message Broker
//!
//! Routes inbound `(RdId, payload)` pairs to the entity bound under that id.
//!
//! # Bind-order tolerance
//!
//! The two endpoints build their entity trees independently, so a message can
//! arrive before the receiving side has bound its entity. Such messages are
//! kept in a bounded pending queue and replayed, in arrival order, when the id
//! is bound.
//!
//! Ids whose subscription was torn down are remembered as *retired*. Messages
//! for a retired id are dropped instead of buffered until the id is bound
//! again, so a torn-down entity never sees stale applies and the pending queue
//! is not flooded by a peer that keeps writing to it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::config::ProtocolConfig;
use crate::error::{LifetimeError, ProtocolError};
use crate::lifetime::Lifetime;

use super::buffer::Buffer;
use super::id::RdId;
use super::scheduler::Scheduler;
use super::wire::WireHandler;

struct Subscription {
    lifetime: Lifetime,
    handler: Arc<dyn WireHandler>,
}

#[derive(Default)]
struct BrokerState {
    subscriptions: HashMap<RdId, Subscription>,
    pending: VecDeque<(RdId, Vec<u8>)>,
    retired: IndexSet<RdId>,
}

/// Inbound router of one endpoint.
pub struct MessageBroker {
    scheduler: Arc<dyn Scheduler>,
    max_pending: usize,
    retired_capacity: usize,
    state: Mutex<BrokerState>,
    me: Weak<MessageBroker>,
}

impl MessageBroker {
    pub fn new(scheduler: Arc<dyn Scheduler>, config: &ProtocolConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            scheduler,
            max_pending: config.max_pending_messages,
            retired_capacity: config.retired_ids_capacity,
            state: Mutex::new(BrokerState::default()),
            me: me.clone(),
        })
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Queue delivery of `payload` to the handler bound for `id`.
    pub fn dispatch(&self, id: RdId, payload: Vec<u8>) {
        let broker = self.me.clone();
        self.scheduler.queue(Box::new(move || {
            if let Some(broker) = broker.upgrade() {
                broker.deliver(id, payload);
            }
        }));
    }

    fn deliver(&self, id: RdId, payload: Vec<u8>) {
        let (lifetime, handler) = {
            let mut state = self.state.lock();
            match state.subscriptions.get(&id) {
                Some(sub) => (sub.lifetime.clone(), Arc::clone(&sub.handler)),
                None => {
                    if state.retired.contains(&id) {
                        trace!(target: "rdsync::recv", %id, "message for retired id ignored");
                    } else {
                        self.buffer_pending(&mut state, id, payload);
                    }
                    return;
                }
            }
        };

        Self::invoke(&lifetime, handler.as_ref(), id, payload);
    }

    fn invoke(lifetime: &Lifetime, handler: &dyn WireHandler, id: RdId, payload: Vec<u8>) {
        trace!(target: "rdsync::recv", %id, len = payload.len(), "deliver");
        lifetime.execute_if_alive(|| {
            let mut buffer = Buffer::from_bytes(payload);
            if let Err(e) = handler.on_wire_received(&mut buffer) {
                error!(target: "rdsync::recv", %id, error = %e, "handler failed");
            }
        });
    }

    fn buffer_pending(&self, state: &mut BrokerState, id: RdId, payload: Vec<u8>) {
        if self.max_pending == 0 {
            warn!(%id, "no handler bound and pending queue disabled, message dropped");
            return;
        }
        if state.pending.len() >= self.max_pending {
            if let Some((evicted, _)) = state.pending.pop_front() {
                warn!(%evicted, limit = self.max_pending, "pending queue full, oldest message evicted");
            }
        }
        trace!(target: "rdsync::recv", %id, "no handler bound yet, message kept pending");
        state.pending.push_back((id, payload));
    }

    /// Register `handler` for `id` until `lifetime` terminates.
    ///
    /// Messages that arrived for `id` before this call are delivered right
    /// away, in arrival order, on the calling thread.
    pub fn advise(&self, lifetime: &Lifetime, id: RdId, handler: Arc<dyn WireHandler>) -> Result<(), ProtocolError> {
        let replay: Vec<Vec<u8>> = {
            let mut state = self.state.lock();
            if state.subscriptions.contains_key(&id) {
                return Err(ProtocolError::DuplicateSubscription { id });
            }
            if !lifetime.is_alive() {
                return Err(ProtocolError::Lifetime(LifetimeError::Terminated));
            }

            state.subscriptions.insert(id, Subscription { lifetime: lifetime.clone(), handler: Arc::clone(&handler) });
            state.retired.shift_remove(&id);

            let mut replay = Vec::new();
            state.pending.retain(|(pending_id, payload)| {
                if *pending_id == id {
                    replay.push(payload.clone());
                    false
                } else {
                    true
                }
            });
            replay
        };

        let broker = self.me.clone();
        let lifetime_id = lifetime.id();
        let attached = lifetime.attach(move || {
            if let Some(broker) = broker.upgrade() {
                broker.retire(id, lifetime_id);
            }
        });
        if let Err(e) = attached {
            self.state.lock().subscriptions.remove(&id);
            return Err(e.into());
        }

        for payload in replay {
            Self::invoke(lifetime, handler.as_ref(), id, payload);
        }
        Ok(())
    }

    fn retire(&self, id: RdId, lifetime_id: u64) {
        let mut state = self.state.lock();
        let owned = state.subscriptions.get(&id).is_some_and(|sub| sub.lifetime.id() == lifetime_id);
        if !owned {
            return;
        }
        state.subscriptions.remove(&id);

        if self.retired_capacity > 0 {
            if state.retired.len() >= self.retired_capacity {
                state.retired.shift_remove_index(0);
            }
            state.retired.insert(id);
        }
        trace!(%id, "subscription retired");
    }

    pub fn is_subscribed(&self, id: RdId) -> bool {
        self.state.lock().subscriptions.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ManualScheduler;

    struct Recorder(Mutex<Vec<i32>>);

    impl WireHandler for Recorder {
        fn on_wire_received(&self, buffer: &mut Buffer) -> Result<(), ProtocolError> {
            self.0.lock().push(buffer.read_i32()?);
            Ok(())
        }
    }

    fn payload(v: i32) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    fn broker(config: &ProtocolConfig) -> (Arc<ManualScheduler>, Arc<MessageBroker>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let broker = MessageBroker::new(scheduler.clone(), config);
        (scheduler, broker)
    }

    #[test]
    fn delivers_to_bound_handler_on_scheduler() {
        let (scheduler, broker) = broker(&ProtocolConfig::default());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let lifetime = Lifetime::new();
        broker.advise(&lifetime, RdId::new(1), recorder.clone()).unwrap();

        broker.dispatch(RdId::new(1), payload(7));
        assert!(recorder.0.lock().is_empty());

        scheduler.pump();
        assert_eq!(*recorder.0.lock(), vec![7]);
    }

    #[test]
    fn messages_before_bind_are_replayed_in_order() {
        let (scheduler, broker) = broker(&ProtocolConfig::default());
        broker.dispatch(RdId::new(5), payload(1));
        broker.dispatch(RdId::new(6), payload(100));
        broker.dispatch(RdId::new(5), payload(2));
        scheduler.pump();
        assert_eq!(broker.pending_count(), 3);

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        broker.advise(&Lifetime::new(), RdId::new(5), recorder.clone()).unwrap();

        assert_eq!(*recorder.0.lock(), vec![1, 2]);
        assert_eq!(broker.pending_count(), 1);
    }

    #[test]
    fn pending_queue_evicts_oldest() {
        let config = ProtocolConfig { max_pending_messages: 2, ..ProtocolConfig::default() };
        let (scheduler, broker) = broker(&config);
        for v in 0..3 {
            broker.dispatch(RdId::new(9), payload(v));
        }
        scheduler.pump();

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        broker.advise(&Lifetime::new(), RdId::new(9), recorder.clone()).unwrap();
        assert_eq!(*recorder.0.lock(), vec![1, 2]);
    }

    #[test]
    fn duplicate_subscription_is_rejected() {
        let (_, broker) = broker(&ProtocolConfig::default());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let lifetime = Lifetime::new();

        broker.advise(&lifetime, RdId::new(3), recorder.clone()).unwrap();
        assert_eq!(
            broker.advise(&lifetime, RdId::new(3), recorder),
            Err(ProtocolError::DuplicateSubscription { id: RdId::new(3) })
        );
    }

    #[test]
    fn retired_ids_ignore_messages_until_rebound() {
        let (scheduler, broker) = broker(&ProtocolConfig::default());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let lifetime = Lifetime::new();
        broker.advise(&lifetime, RdId::new(4), recorder.clone()).unwrap();

        lifetime.terminate().unwrap();
        assert!(!broker.is_subscribed(RdId::new(4)));

        broker.dispatch(RdId::new(4), payload(1));
        scheduler.pump();
        assert_eq!(broker.pending_count(), 0);
        assert!(recorder.0.lock().is_empty());

        broker.advise(&Lifetime::new(), RdId::new(4), recorder.clone()).unwrap();
        broker.dispatch(RdId::new(4), payload(2));
        scheduler.pump();
        assert_eq!(*recorder.0.lock(), vec![2]);
    }
}
