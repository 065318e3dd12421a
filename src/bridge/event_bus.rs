//! Single fan-out channel for events of every session
//!
//! Best-effort: with no receiver attached an event is dropped, not buffered.
//! Events published from one task reach each receiver in publish order.

use crate::protocol::events::BridgeEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{trace, warn};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to every current receiver
    pub fn publish(&self, event: BridgeEvent) {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => trace!(event = %kind, receivers, "Event published"),
            Err(_) => trace!(event = %kind, "Event dropped, no receivers"),
        }
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receiving end of the bus
#[derive(Debug)]
pub struct EventStream {
    receiver: broadcast::Receiver<BridgeEvent>,
}

impl EventStream {
    /// Next event; `None` once the bus is gone.
    ///
    /// A receiver that falls behind skips the overwritten events and keeps going.
    pub async fn next(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event receiver lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Self::next`]
    pub fn try_next(&mut self) -> Option<BridgeEvent> {
        use broadcast::error::TryRecvError;
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event receiver lagged, events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
