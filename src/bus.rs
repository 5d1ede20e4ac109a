use tokio::sync::broadcast;

use crate::message::InboundEvent;

const BUS_CAPACITY: usize = 64;

/// Host-side inbound message event. Every listener sees every event and
/// filters by origin itself.
#[derive(Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<InboundEvent>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Dispatch an event. Returns how many listeners were attached.
    pub fn publish(&self, event: InboundEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
