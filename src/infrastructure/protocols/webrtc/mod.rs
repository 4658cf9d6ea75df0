//! WebRTC protocol implementation
pub mod connection;
pub mod peer_link;
pub mod sdp;
pub mod simulated;

pub use connection::{ConnectionObserver, IceConnectionState, PeerConnection, PeerConnectionFactory};
pub use peer_link::{LinkEvent, LinkEventHandler, PeerLink};
pub use sdp::{
    create_answer, create_offer, DtlsFingerprint, DtlsSetup, MediaDescription, MediaDirection,
    MediaType, RtpCodec, SdpType, SessionDescription, WebRtcSdp,
};
pub use simulated::{SimulatedConnection, SimulatedConnectionFactory};
