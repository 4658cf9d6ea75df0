//! Call event bus
//!
//! Fan-out of [`CallEvent`]s to UI subscribers over a broadcast channel.
//! Slow subscribers lag and lose the oldest events; publishing never blocks.

use crate::domain::call::event::{CallEvent, CallEventEnvelope};
use crate::domain::shared::events::{DomainEvent, EventEnvelope};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone)]
pub struct CallEventBus {
    tx: broadcast::Sender<CallEventEnvelope>,
}

impl CallEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEventEnvelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CallEvent) {
        debug!(call_id = %event.call_id(), "Publishing {}", event.event_type());
        if self.tx.send(EventEnvelope::wrap(event)).is_err() {
            debug!("No subscribers for call events");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for CallEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::value_objects::CallId;

    #[tokio::test]
    async fn test_subscribers_receive_envelopes() {
        let bus = CallEventBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let call_id = CallId::new();
        bus.publish(CallEvent::CallTimedOut { call_id });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.metadata.event_type, "call.timed_out");
        assert_eq!(envelope.event, CallEvent::CallTimedOut { call_id });
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let bus = CallEventBus::default();
        bus.publish(CallEvent::CallTimedOut { call_id: CallId::new() });
    }
}
