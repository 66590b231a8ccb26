use tokio::sync::broadcast;

use amelia_types::WorkflowEvent;

/// Grounded in the teacher's `tandem-core::event_bus::EventBus`: a single
/// `tokio::sync::broadcast` channel. `emit` (§4.6) is non-blocking — it
/// hands the event to the channel and returns; slow subscriber work must
/// be forked off by the subscriber itself, never by the bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// At-most-once delivery to whatever is currently subscribed; a lagged
    /// receiver drops old events rather than blocking the publisher.
    pub fn emit(&self, event: WorkflowEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
