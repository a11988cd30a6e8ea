//! Publishing committed domain events onto the event bus.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;

use boxoffice_core::EventId;
use boxoffice_events::{Event, EventBus, EventEnvelope};

/// Object-safe view of an `EventBus` carrying JSON envelopes.
pub trait EventSink: Send + Sync {
    fn publish_envelope(&self, envelope: EventEnvelope<JsonValue>) -> Result<(), String>;
}

impl<B> EventSink for B
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    fn publish_envelope(&self, envelope: EventEnvelope<JsonValue>) -> Result<(), String> {
        self.publish(envelope).map_err(|e| format!("{e:?}"))
    }
}

/// Wraps typed events in envelopes and publishes them. Failures are logged;
/// the write that produced the event has already committed.
#[derive(Clone)]
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
}

impl core::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPublisher").finish_non_exhaustive()
    }
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn publish<T>(&self, event_id: EventId, stream: &str, subject_id: Uuid, event: &T)
    where
        T: Event + Serialize,
    {
        let envelope = match EventEnvelope::from_typed(event_id, stream, subject_id, event) {
            Ok(env) => env,
            Err(e) => {
                warn!(%event_id, event_type = event.event_type(), error = %e, "failed to encode domain event");
                return;
            }
        };
        if let Err(e) = self.sink.publish_envelope(envelope) {
            warn!(%event_id, event_type = event.event_type(), error = %e, "failed to publish domain event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxoffice_events::InMemoryEventBus;
    use boxoffice_inventory::InventoryEvent;
    use chrono::Utc;

    #[test]
    fn publishes_json_envelopes() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<JsonValue>>> = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let publisher = EventPublisher::new(bus.clone());

        let event_id = EventId::new();
        let event = InventoryEvent::TicketsReserved(boxoffice_inventory::TicketsReserved {
            event_id,
            ticket_type: Some("GA".to_string()),
            quantity: 2,
            remaining: 8,
            occurred_at: Utc::now(),
        });
        publisher.publish(event_id, "inventory", *event_id.as_uuid(), &event);

        let got = sub.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event_type(), "inventory.tickets.reserved");
        assert_eq!(got[0].stream(), "inventory");
        assert_eq!(got[0].payload()["TicketsReserved"]["remaining"], 8);
    }
}
