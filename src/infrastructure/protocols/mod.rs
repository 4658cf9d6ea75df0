//! Protocol implementations (ICE, WebRTC, signaling)
pub mod ice;
pub mod signaling;
pub mod webrtc;
