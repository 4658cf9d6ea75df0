//! Signaling messages and the transport contract that carries them
//!
//! The transport (Firestore listener, WebSocket, in-process hub) is an
//! external collaborator. Messages reaching the core have already been
//! decoded and validated at the transport boundary.

use crate::domain::call::value_object::CallKind;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ParticipantId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Why a participant is leaving or refusing a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByeReason {
    Hangup,
    Declined,
    Busy,
    Timeout,
    Failed,
}

/// ICE candidate as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDescriptor {
    /// `candidate:` attribute line
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
}

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// SDP offer, either the initial one or an ICE restart
    Offer {
        call_id: CallId,
        from: ParticipantId,
        kind: CallKind,
        sdp: String,
        #[serde(default)]
        ice_restart: bool,
    },
    /// SDP answer
    Answer {
        call_id: CallId,
        from: ParticipantId,
        sdp: String,
    },
    /// Trickled ICE candidate
    IceCandidate {
        call_id: CallId,
        from: ParticipantId,
        candidate: CandidateDescriptor,
    },
    /// Leave, decline or busy signal
    Bye {
        call_id: CallId,
        from: ParticipantId,
        reason: ByeReason,
    },
}

impl SignalingMessage {
    pub fn call_id(&self) -> &CallId {
        match self {
            SignalingMessage::Offer { call_id, .. }
            | SignalingMessage::Answer { call_id, .. }
            | SignalingMessage::IceCandidate { call_id, .. }
            | SignalingMessage::Bye { call_id, .. } => call_id,
        }
    }

    pub fn sender(&self) -> &ParticipantId {
        match self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. }
            | SignalingMessage::Bye { from, .. } => from,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice_candidate",
            SignalingMessage::Bye { .. } => "bye",
        }
    }

    /// A fresh offer, i.e. one that could start a new call
    pub fn is_initial_offer(&self) -> bool {
        matches!(self, SignalingMessage::Offer { ice_restart: false, .. })
    }
}

/// Stops message delivery when dropped
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Transport contract consumed by the core
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Deliver a message to one participant
    async fn send(&self, to: &ParticipantId, message: SignalingMessage) -> Result<()>;

    /// Route every message for `call_id` addressed to the local participant into `inbox`
    fn subscribe(&self, call_id: CallId, inbox: mpsc::UnboundedSender<SignalingMessage>) -> Subscription;

    /// Route messages for calls the local participant has not subscribed to
    /// (new offers, stray messages) into `inbox`
    fn listen(&self, inbox: mpsc::UnboundedSender<SignalingMessage>) -> Subscription;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_message_wire_shape() {
        let message = SignalingMessage::Bye {
            call_id: CallId::new(),
            from: ParticipantId::from("bob"),
            reason: ByeReason::Busy,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "bye");
        assert_eq!(json["from"], "bob");
        assert_eq!(json["reason"], "busy");
    }

    #[test]
    fn test_offer_restart_flag_defaults_to_false() {
        let call_id = CallId::new();
        let json = serde_json::json!({
            "type": "offer",
            "call_id": call_id,
            "from": "alice",
            "kind": "video",
            "sdp": "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
        });
        let message: SignalingMessage = serde_json::from_value(json).unwrap();
        assert!(message.is_initial_offer());
        assert_eq!(message.call_id(), &call_id);
        assert_eq!(message.sender().as_str(), "alice");
    }

    #[test]
    fn test_subscription_cancels_once() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = cancelled.clone();
        let subscription = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        subscription.unsubscribe();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        let counter = cancelled.clone();
        drop(Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
    }
}
