//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Protocol implementations (ICE, WebRTC negotiation, signaling codec)
//! - In-process adapters for the media engine, signaling transport and call history

pub mod media;
pub mod persistence;
pub mod protocols;
