//! Call value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of call, fixed at session creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn has_video(&self) -> bool {
        matches!(self, CallKind::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Voice => "voice",
            CallKind::Video => "video",
        }
    }
}

/// Call direction as seen from the local participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Session lifecycle state
///
/// Idle -> (Outgoing | Incoming) -> Connecting -> Active -> Ended.
/// Failed is reachable from Outgoing, Incoming, Connecting and Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Outgoing,
    Incoming,
    Connecting,
    Active,
    Ended,
    Failed,
}

impl SessionState {
    /// Ended and Failed are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }

    /// Non-Idle, non-terminal states occupy the process-wide call slot
    pub fn is_live(&self) -> bool {
        !self.is_terminal() && *self != SessionState::Idle
    }

    /// Check if state transition is valid
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Idle, Outgoing) | (Idle, Incoming) => true,
            (Outgoing, Connecting) | (Incoming, Connecting) => true,
            (Connecting, Active) => true,
            (Outgoing | Incoming | Connecting | Active, Failed) => true,
            // end() is always allowed, including a rejected Incoming or an Idle session
            (Idle | Outgoing | Incoming | Connecting | Active, Ended) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Outgoing => "Outgoing",
            SessionState::Incoming => "Incoming",
            SessionState::Connecting => "Connecting",
            SessionState::Active => "Active",
            SessionState::Ended => "Ended",
            SessionState::Failed => "Failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Negotiation state of one peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerLinkState {
    New,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Disconnected,
    Closed,
}

impl PeerLinkState {
    fn rank(&self) -> u8 {
        match self {
            PeerLinkState::New => 0,
            PeerLinkState::OfferSent | PeerLinkState::OfferReceived => 1,
            PeerLinkState::AnswerSent | PeerLinkState::AnswerReceived => 2,
            PeerLinkState::Connected => 3,
            PeerLinkState::Disconnected => 4,
            PeerLinkState::Closed => 5,
        }
    }

    /// Link states only move forward, except Disconnected -> Connected
    /// (ICE recovery). Closed is reachable from anywhere.
    pub fn can_transition_to(&self, next: PeerLinkState) -> bool {
        if *self == PeerLinkState::Closed {
            return false;
        }
        if next == PeerLinkState::Closed {
            return true;
        }
        if *self == PeerLinkState::Disconnected && next == PeerLinkState::Connected {
            return true;
        }
        next.rank() > self.rank()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, PeerLinkState::Connected)
    }
}

impl fmt::Display for PeerLinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Which side of the offer/answer exchange a link plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkRole {
    /// Creates the offer
    Caller,
    /// Answers the offer
    Callee,
}

/// Local media flags, owned by the call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    pub muted: bool,
    pub video_enabled: bool,
}

impl MediaFlags {
    pub fn for_kind(kind: CallKind) -> Self {
        Self {
            muted: false,
            video_enabled: kind.has_video(),
        }
    }
}

/// Why a session ended or failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local hang-up
    LocalHangup,
    /// Remote party hung up
    RemoteHangup,
    /// Local side rejected an incoming call
    Rejected,
    /// Remote side declined our offer
    RemoteDeclined,
    /// Remote side is in another call
    RemoteBusy,
    /// No Active state within the ring timeout
    CallTimedOut,
    /// Local camera or microphone unavailable
    MediaUnavailable(String),
    /// Every peer link failed, or too few remain to reach quorum
    LinksFailed,
}

impl EndReason {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EndReason::CallTimedOut | EndReason::MediaUnavailable(_) | EndReason::LinksFailed
        )
    }
}

/// Outcome written to call history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Completed,
    Missed,
    Declined,
    Busy,
    Cancelled,
    Failed,
    TimedOut,
}

impl CallOutcome {
    /// Derive the outcome from how the session ended
    pub fn from_end(reason: &EndReason, direction: CallDirection, was_answered: bool) -> Self {
        match reason {
            _ if was_answered && !reason.is_failure() => CallOutcome::Completed,
            EndReason::LocalHangup => match direction {
                CallDirection::Outgoing => CallOutcome::Cancelled,
                CallDirection::Incoming => CallOutcome::Declined,
            },
            EndReason::RemoteHangup => match direction {
                CallDirection::Incoming => CallOutcome::Missed,
                CallDirection::Outgoing => CallOutcome::Cancelled,
            },
            EndReason::Rejected | EndReason::RemoteDeclined => CallOutcome::Declined,
            EndReason::RemoteBusy => CallOutcome::Busy,
            EndReason::CallTimedOut => match direction {
                CallDirection::Incoming => CallOutcome::Missed,
                CallDirection::Outgoing => CallOutcome::TimedOut,
            },
            EndReason::MediaUnavailable(_) | EndReason::LinksFailed => CallOutcome::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_transitions() {
        assert!(SessionState::Idle.can_transition_to(SessionState::Outgoing));
        assert!(SessionState::Outgoing.can_transition_to(SessionState::Connecting));
        assert!(SessionState::Connecting.can_transition_to(SessionState::Active));
        assert!(SessionState::Active.can_transition_to(SessionState::Failed));

        assert!(!SessionState::Idle.can_transition_to(SessionState::Active));
        assert!(!SessionState::Outgoing.can_transition_to(SessionState::Active));
        assert!(!SessionState::Ended.can_transition_to(SessionState::Idle));
        assert!(!SessionState::Failed.can_transition_to(SessionState::Ended));
    }

    #[test]
    fn test_session_state_helpers() {
        assert!(!SessionState::Idle.is_live());
        assert!(SessionState::Incoming.is_live());
        assert!(SessionState::Active.is_live());
        assert!(SessionState::Ended.is_terminal());
        assert!(!SessionState::Failed.is_live());
    }

    #[test]
    fn test_link_state_is_monotonic() {
        use PeerLinkState::*;

        assert!(New.can_transition_to(OfferSent));
        assert!(OfferSent.can_transition_to(AnswerReceived));
        assert!(AnswerReceived.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connected));

        assert!(!AnswerSent.can_transition_to(OfferReceived));
        assert!(!Connected.can_transition_to(AnswerReceived));
        assert!(!Disconnected.can_transition_to(OfferSent));
    }

    #[test]
    fn test_link_state_closed_is_terminal() {
        for state in [
            PeerLinkState::New,
            PeerLinkState::OfferReceived,
            PeerLinkState::Connected,
            PeerLinkState::Disconnected,
        ] {
            assert!(state.can_transition_to(PeerLinkState::Closed));
        }
        assert!(!PeerLinkState::Closed.can_transition_to(PeerLinkState::Closed));
        assert!(!PeerLinkState::Closed.can_transition_to(PeerLinkState::Connected));
    }

    #[test]
    fn test_media_flags_follow_kind() {
        assert!(!MediaFlags::for_kind(CallKind::Voice).video_enabled);
        assert!(MediaFlags::for_kind(CallKind::Video).video_enabled);
    }

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(
            CallOutcome::from_end(&EndReason::RemoteHangup, CallDirection::Outgoing, true),
            CallOutcome::Completed
        );
        assert_eq!(
            CallOutcome::from_end(&EndReason::RemoteHangup, CallDirection::Incoming, false),
            CallOutcome::Missed
        );
        assert_eq!(
            CallOutcome::from_end(&EndReason::CallTimedOut, CallDirection::Outgoing, false),
            CallOutcome::TimedOut
        );
        assert_eq!(
            CallOutcome::from_end(&EndReason::RemoteBusy, CallDirection::Outgoing, false),
            CallOutcome::Busy
        );
        assert_eq!(
            CallOutcome::from_end(&EndReason::LinksFailed, CallDirection::Outgoing, true),
            CallOutcome::Failed
        );
    }
}
