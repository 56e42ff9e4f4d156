//! Wire
//!
//! The wire turns per-entity messages into frames on a byte stream and back.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+---------------------+
//! | u32 LE length  | i64 LE RdId    | payload             |
//! +----------------+----------------+---------------------+
//!                   <------------- length bytes ---------->
//! ```
//!
//! `length` counts everything after itself, so it is always at least 8. It
//! is also capped by `max_frame_size`: a longer declared length is treated as
//! a corrupt stream instead of being buffered.
//!
//! Sends while disconnected are dropped. Entities keep track of what they
//! could not send and resync their state when the wire reconnects, so the
//! wire never queues outgoing traffic.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, trace, warn};

use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, TransportError};
use crate::lifetime::Lifetime;
use crate::reactive::ViewableProperty;

use super::broker::MessageBroker;
use super::buffer::Buffer;
use super::id::RdId;
use super::scheduler::Scheduler;

const LENGTH_SIZE: usize = 4;
const ID_SIZE: usize = 8;

/// Receiver of the messages addressed to one id.
pub trait WireHandler: Send + Sync {
    fn on_wire_received(&self, buffer: &mut Buffer) -> Result<(), ProtocolError>;
}

/// Framed, id-addressed message channel between two endpoints.
pub trait Wire: Send + Sync {
    /// Send `payload` to the entity bound under `id` on the other side.
    fn send(&self, id: RdId, payload: &[u8]);

    /// Route messages for `id` to `handler` until `lifetime` terminates.
    fn advise(&self, lifetime: &Lifetime, id: RdId, handler: Arc<dyn WireHandler>) -> Result<(), ProtocolError>;

    fn connected(&self) -> &ViewableProperty<bool>;

    fn is_connected(&self) -> bool {
        self.connected().value()
    }
}

impl dyn Wire {
    /// Build the payload with `writer` and send it.
    pub fn send_with<F>(&self, id: RdId, writer: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut Buffer) -> Result<(), ProtocolError>,
    {
        let mut buffer = Buffer::new();
        writer(&mut buffer)?;
        self.send(id, buffer.as_slice());
        Ok(())
    }
}

/// Outgoing half of a byte-stream connection.
///
/// Inbound bytes and connection changes are pushed into the wire by whoever
/// owns the transport, through [`FramedWire::receive`] and
/// [`FramedWire::set_connected`].
pub trait Transport: Send + Sync {
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// [`Wire`] implementation over a [`Transport`].
pub struct FramedWire {
    name: String,
    broker: Arc<MessageBroker>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    connected: ViewableProperty<bool>,
    inbound: Mutex<Vec<u8>>,
    max_frame: u32,
}

impl FramedWire {
    pub fn new(scheduler: Arc<dyn Scheduler>, config: &ProtocolConfig) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            broker: MessageBroker::new(scheduler, config),
            transport: RwLock::new(None),
            connected: ViewableProperty::new(false),
            inbound: Mutex::new(Vec::new()),
            max_frame: config.max_frame_size.max(ID_SIZE as u32),
        })
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    pub fn set_transport(&self, transport: Option<Arc<dyn Transport>>) {
        *self.transport.write() = transport;
    }

    /// Report a connection state change. Going down discards any partial
    /// inbound frame.
    pub fn set_connected(&self, connected: bool) {
        if !connected {
            self.inbound.lock().clear();
        }
        if self.connected.set(connected) {
            trace!(wire = %self.name, connected, "connection state changed");
        }
    }

    /// Feed bytes read from the transport. Bytes may split frames at any
    /// position; complete frames are dispatched in order.
    pub fn receive(&self, bytes: &[u8]) {
        let frames = {
            let mut inbound = self.inbound.lock();
            inbound.extend_from_slice(bytes);
            match self.split_frames(&mut inbound) {
                Ok(frames) => frames,
                Err(e) => {
                    error!(wire = %self.name, error = %e, "transport fault, dropping connection");
                    inbound.clear();
                    drop(inbound);
                    self.set_connected(false);
                    return;
                }
            }
        };

        for (id, payload) in frames {
            trace!(target: "rdsync::recv", wire = %self.name, %id, len = payload.len(), "frame");
            self.broker.dispatch(id, payload);
        }
    }

    fn split_frames(&self, inbound: &mut Vec<u8>) -> Result<Vec<(RdId, Vec<u8>)>, TransportError> {
        let mut frames = Vec::new();
        let mut offset = 0;

        while inbound.len() - offset >= LENGTH_SIZE {
            let mut length_bytes = [0u8; LENGTH_SIZE];
            length_bytes.copy_from_slice(&inbound[offset..offset + LENGTH_SIZE]);
            let length = u32::from_le_bytes(length_bytes);
            if (length as usize) < ID_SIZE || length > self.max_frame {
                return Err(TransportError::MalformedFrame { length, max: self.max_frame });
            }

            let end = offset + LENGTH_SIZE + length as usize;
            if inbound.len() < end {
                break;
            }

            let mut id_bytes = [0u8; ID_SIZE];
            id_bytes.copy_from_slice(&inbound[offset + LENGTH_SIZE..offset + LENGTH_SIZE + ID_SIZE]);
            let id = RdId::new(i64::from_le_bytes(id_bytes));
            let payload = inbound[offset + LENGTH_SIZE + ID_SIZE..end].to_vec();

            frames.push((id, payload));
            offset = end;
        }

        inbound.drain(..offset);
        Ok(frames)
    }

    /// Encode one frame.
    pub fn encode_frame(id: RdId, payload: &[u8]) -> Vec<u8> {
        let mut buffer = Buffer::with_capacity(LENGTH_SIZE + ID_SIZE + payload.len());
        buffer.write_u32((ID_SIZE + payload.len()) as u32);
        buffer.write_rd_id(id);
        buffer.write_raw(payload);
        buffer.into_bytes()
    }
}

impl Wire for FramedWire {
    fn send(&self, id: RdId, payload: &[u8]) {
        if !self.is_connected() {
            warn!(target: "rdsync::send", wire = %self.name, %id, "not connected, message dropped");
            return;
        }
        if ID_SIZE + payload.len() > self.max_frame as usize {
            error!(target: "rdsync::send", wire = %self.name, %id, len = payload.len(), max = self.max_frame, "frame too large, message dropped");
            return;
        }
        let Some(transport) = self.transport.read().clone() else {
            warn!(target: "rdsync::send", wire = %self.name, %id, "no transport, message dropped");
            return;
        };

        trace!(target: "rdsync::send", wire = %self.name, %id, len = payload.len(), "frame");
        if let Err(e) = transport.send(&Self::encode_frame(id, payload)) {
            warn!(target: "rdsync::send", wire = %self.name, %id, error = %e, "send failed");
            if matches!(e, TransportError::Closed | TransportError::NotConnected) {
                self.set_connected(false);
            }
        }
    }

    fn advise(&self, lifetime: &Lifetime, id: RdId, handler: Arc<dyn WireHandler>) -> Result<(), ProtocolError> {
        self.broker.advise(lifetime, id, handler)
    }

    fn connected(&self) -> &ViewableProperty<bool> {
        &self.connected
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ManualScheduler;

    struct Collect(Mutex<Vec<Vec<u8>>>);

    impl WireHandler for Collect {
        fn on_wire_received(&self, buffer: &mut Buffer) -> Result<(), ProtocolError> {
            self.0.lock().push(buffer.read_remaining().to_vec());
            Ok(())
        }
    }

    struct Sink(Mutex<Vec<Vec<u8>>>);

    impl Transport for Sink {
        fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
            self.0.lock().push(bytes.to_vec());
            Ok(())
        }
    }

    fn wire() -> (Arc<ManualScheduler>, Arc<FramedWire>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let wire = FramedWire::new(scheduler.clone(), &ProtocolConfig::default());
        (scheduler, wire)
    }

    #[test]
    fn frame_layout() {
        let frame = FramedWire::encode_frame(RdId::new(1), &[9, 9]);
        assert_eq!(frame, vec![10, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 9, 9]);
    }

    #[test]
    fn fragmented_frames_are_reassembled() {
        let (scheduler, wire) = wire();
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        wire.advise(&Lifetime::new(), RdId::new(42), collect.clone()).unwrap();

        let mut stream = FramedWire::encode_frame(RdId::new(42), b"hello");
        stream.extend(FramedWire::encode_frame(RdId::new(42), b""));
        stream.extend(FramedWire::encode_frame(RdId::new(42), b"world"));

        for chunk in stream.chunks(3) {
            wire.receive(chunk);
        }
        scheduler.pump();

        assert_eq!(*collect.0.lock(), vec![b"hello".to_vec(), Vec::new(), b"world".to_vec()]);
    }

    #[test]
    fn malformed_frame_disconnects() {
        let (_, wire) = wire();
        wire.set_connected(true);

        wire.receive(&[3, 0, 0, 0, 1, 2, 3]);
        assert!(!wire.is_connected());
    }

    #[test]
    fn oversized_declared_length_disconnects_without_buffering() {
        let scheduler = Arc::new(ManualScheduler::new());
        let config = ProtocolConfig { max_frame_size: 64, ..ProtocolConfig::default() };
        let wire = FramedWire::new(scheduler, &config);
        wire.set_connected(true);

        wire.receive(&[0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3]);
        assert!(!wire.is_connected());
        assert!(wire.inbound.lock().is_empty());

        let mut buffer = 65u32.to_le_bytes().to_vec();
        let err = wire.split_frames(&mut buffer).unwrap_err();
        assert_eq!(err, TransportError::MalformedFrame { length: 65, max: 64 });
    }

    #[test]
    fn oversized_send_is_dropped() {
        let scheduler = Arc::new(ManualScheduler::new());
        let config = ProtocolConfig { max_frame_size: 16, ..ProtocolConfig::default() };
        let wire = FramedWire::new(scheduler, &config);
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        wire.set_transport(Some(sink.clone()));
        wire.set_connected(true);

        wire.send(RdId::new(1), &[0; 9]);
        assert!(sink.0.lock().is_empty());

        wire.send(RdId::new(1), &[0; 8]);
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[test]
    fn send_while_disconnected_is_dropped() {
        let (_, wire) = wire();
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        wire.set_transport(Some(sink.clone()));

        wire.send(RdId::new(1), &[1]);
        assert!(sink.0.lock().is_empty());

        wire.set_connected(true);
        let dyn_wire: &dyn Wire = wire.as_ref();
        dyn_wire
            .send_with(RdId::new(1), |buffer| {
                buffer.write_i32(5);
                Ok(())
            })
            .unwrap();
        assert_eq!(sink.0.lock().len(), 1);
        assert_eq!(sink.0.lock()[0].len(), 4 + 8 + 4);
    }
}
