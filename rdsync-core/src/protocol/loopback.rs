//! In-process transport linking two wires directly.

use std::sync::{Arc, Weak};

use crate::error::TransportError;

use super::wire::{FramedWire, Transport};

/// Transport that hands every frame to the peer wire synchronously.
pub struct LoopbackTransport {
    peer: Weak<FramedWire>,
}

impl LoopbackTransport {
    /// Link `a` and `b` and mark both connected.
    pub fn connect(a: &Arc<FramedWire>, b: &Arc<FramedWire>) {
        a.set_transport(Some(Arc::new(LoopbackTransport { peer: Arc::downgrade(b) })));
        b.set_transport(Some(Arc::new(LoopbackTransport { peer: Arc::downgrade(a) })));
        a.set_connected(true);
        b.set_connected(true);
    }

    /// Unlink `a` and `b` and mark both disconnected.
    pub fn disconnect(a: &Arc<FramedWire>, b: &Arc<FramedWire>) {
        a.set_connected(false);
        b.set_connected(false);
        a.set_transport(None);
        b.set_transport(None);
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let peer = self.peer.upgrade().ok_or(TransportError::Closed)?;
        peer.receive(bytes);
        Ok(())
    }
}
