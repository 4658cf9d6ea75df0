//! Call events published to the UI layer

use crate::domain::call::value_object::{CallKind, EndReason, MediaFlags, PeerLinkState, SessionState};
use crate::domain::shared::events::{DomainEvent, EventEnvelope};
use crate::domain::shared::value_objects::{CallId, ParticipantId};
use serde::{Deserialize, Serialize};

/// Union of all events the core emits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    SessionStateChanged {
        call_id: CallId,
        previous: SessionState,
        state: SessionState,
        reason: Option<EndReason>,
    },
    LinkStateChanged {
        call_id: CallId,
        participant: ParticipantId,
        state: PeerLinkState,
    },
    IncomingCall {
        call_id: CallId,
        from: ParticipantId,
        kind: CallKind,
    },
    CallTimedOut {
        call_id: CallId,
    },
    LinkFailed {
        call_id: CallId,
        participant: ParticipantId,
        reason: String,
    },
    MediaFlagsChanged {
        call_id: CallId,
        flags: MediaFlags,
    },
    /// Remote media from `participant` is ready to render
    RemoteStreamAttached {
        call_id: CallId,
        participant: ParticipantId,
        has_video: bool,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            CallEvent::SessionStateChanged { call_id, .. } => call_id,
            CallEvent::LinkStateChanged { call_id, .. } => call_id,
            CallEvent::IncomingCall { call_id, .. } => call_id,
            CallEvent::CallTimedOut { call_id } => call_id,
            CallEvent::LinkFailed { call_id, .. } => call_id,
            CallEvent::MediaFlagsChanged { call_id, .. } => call_id,
            CallEvent::RemoteStreamAttached { call_id, .. } => call_id,
        }
    }
}

impl DomainEvent for CallEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CallEvent::SessionStateChanged { .. } => "call.session_state_changed",
            CallEvent::LinkStateChanged { .. } => "call.link_state_changed",
            CallEvent::IncomingCall { .. } => "call.incoming",
            CallEvent::CallTimedOut { .. } => "call.timed_out",
            CallEvent::LinkFailed { .. } => "call.link_failed",
            CallEvent::MediaFlagsChanged { .. } => "call.media_flags_changed",
            CallEvent::RemoteStreamAttached { .. } => "call.remote_stream_attached",
        }
    }
}

/// Envelope type carried on the event bus
pub type CallEventEnvelope = EventEnvelope<CallEvent>;
