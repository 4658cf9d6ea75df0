//! Event envelope shared by everything published on the event bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Something that happened to a call, named for subscribers
pub trait DomainEvent: Send + Sync {
    fn event_type(&self) -> &'static str;
}

/// Identity and timestamp stamped on every published event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event_type: String,
}

impl EventMetadata {
    pub fn new(event_type: String) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event_type,
        }
    }
}

/// An event together with its metadata, as published to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    pub metadata: EventMetadata,
    pub event: E,
}

impl<E: DomainEvent> EventEnvelope<E> {
    pub fn wrap(event: E) -> Self {
        Self {
            metadata: EventMetadata::new(event.event_type().to_string()),
            event,
        }
    }
}
