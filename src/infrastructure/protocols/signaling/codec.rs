//! JSON wire codec for signaling messages
//!
//! Messages are tagged objects (`{"type": "offer", ...}`). Decoding also
//! validates the payload so that malformed SDP or candidates are rejected
//! at the transport boundary and never reach a call session.

use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::signaling::SignalingMessage;
use crate::infrastructure::protocols::ice::IceCandidate;
use crate::infrastructure::protocols::webrtc::sdp::{SdpType, WebRtcSdp};

#[derive(Debug, Clone, Copy, Default)]
pub struct SignalingCodec;

impl SignalingCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, message: &SignalingMessage) -> Result<String> {
        Ok(serde_json::to_string(message)?)
    }

    pub fn decode(&self, frame: &str) -> Result<SignalingMessage> {
        let message: SignalingMessage = serde_json::from_str(frame)?;
        self.validate(&message)?;
        Ok(message)
    }

    /// Check the fields serde cannot check
    pub fn validate(&self, message: &SignalingMessage) -> Result<()> {
        if message.sender().is_empty() {
            return Err(CallError::Codec(format!("{} without a sender", message.name())));
        }

        match message {
            SignalingMessage::Offer { sdp, .. } => validate_sdp(sdp, SdpType::Offer),
            SignalingMessage::Answer { sdp, .. } => validate_sdp(sdp, SdpType::Answer),
            SignalingMessage::IceCandidate { candidate, .. } => {
                IceCandidate::from_descriptor(candidate).map(|_| ())
            }
            SignalingMessage::Bye { .. } => Ok(()),
        }
    }
}

fn validate_sdp(sdp: &str, sdp_type: SdpType) -> Result<()> {
    WebRtcSdp::from_sdp_string(sdp, sdp_type)
        .map(|_| ())
        .map_err(|e| CallError::Codec(format!("invalid {} SDP: {}", sdp_type.as_str(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::value_object::CallKind;
    use crate::domain::shared::value_objects::{CallId, ParticipantId};
    use crate::domain::signaling::{ByeReason, CandidateDescriptor};

    const SDP: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n";

    #[test]
    fn test_offer_passes_through() {
        let codec = SignalingCodec::new();
        let offer = SignalingMessage::Offer {
            call_id: CallId::new(),
            from: ParticipantId::from("alice"),
            kind: CallKind::Voice,
            sdp: SDP.to_string(),
            ice_restart: false,
        };

        let frame = codec.encode(&offer).unwrap();
        assert!(frame.contains("\"type\":\"offer\""));
        assert_eq!(codec.decode(&frame).unwrap(), offer);
    }

    #[test]
    fn test_rejects_unknown_type_and_bad_json() {
        let codec = SignalingCodec::new();
        assert!(matches!(codec.decode("not json"), Err(CallError::Codec(_))));
        assert!(matches!(
            codec.decode(r#"{"type":"ring","call_id":"x","from":"a"}"#),
            Err(CallError::Codec(_))
        ));
    }

    #[test]
    fn test_rejects_sdp_without_media() {
        let codec = SignalingCodec::new();
        let answer = SignalingMessage::Answer {
            call_id: CallId::new(),
            from: ParticipantId::from("bob"),
            sdp: "v=0\r\ns=-\r\n".to_string(),
        };
        let frame = serde_json::to_string(&answer).unwrap();
        assert!(matches!(codec.decode(&frame), Err(CallError::Codec(_))));
    }

    #[test]
    fn test_rejects_bad_candidate_and_missing_sender() {
        let codec = SignalingCodec::new();
        let candidate = SignalingMessage::IceCandidate {
            call_id: CallId::new(),
            from: ParticipantId::from("bob"),
            candidate: CandidateDescriptor {
                candidate: "candidate:garbage".to_string(),
                sdp_mid: None,
                sdp_m_line_index: None,
            },
        };
        assert!(codec.validate(&candidate).is_err());

        let bye = SignalingMessage::Bye {
            call_id: CallId::new(),
            from: ParticipantId::from("  "),
            reason: ByeReason::Hangup,
        };
        assert!(codec.validate(&bye).is_err());
    }
}
