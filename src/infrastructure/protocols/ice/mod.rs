/// ICE (Interactive Connectivity Establishment) candidate handling
/// RFC 8445 / RFC 8839
pub mod candidate;

pub use candidate::{CandidateType, IceCandidate, TransportProtocol};
