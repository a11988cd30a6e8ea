use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use boxoffice_core::EventId;

use crate::event::Event;

/// Envelope for a published domain event.
///
/// Every event in this system concerns one ticketed event, so `event_id`
/// (the ticketed event) is the partition key consumers group by. `stream`
/// names the record family ("inventory", "booking", "waitlist") and
/// `subject_id` the record inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    message_id: Uuid,
    event_id: EventId,
    stream: String,
    subject_id: Uuid,
    event_type: String,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        message_id: Uuid,
        event_id: EventId,
        stream: impl Into<String>,
        subject_id: Uuid,
        event_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            message_id,
            event_id,
            stream: stream.into(),
            subject_id,
            event_type: event_type.into(),
            occurred_at,
            payload,
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn subject_id(&self) -> Uuid {
        self.subject_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl EventEnvelope<JsonValue> {
    /// Wrap a typed domain event, serializing it to JSON.
    pub fn from_typed<T>(
        event_id: EventId,
        stream: impl Into<String>,
        subject_id: Uuid,
        event: &T,
    ) -> Result<Self, serde_json::Error>
    where
        T: Event + Serialize,
    {
        let payload = serde_json::to_value(event)?;
        Ok(Self::new(
            Uuid::now_v7(),
            event_id,
            stream,
            subject_id,
            event.event_type(),
            event.occurred_at(),
            payload,
        ))
    }
}
