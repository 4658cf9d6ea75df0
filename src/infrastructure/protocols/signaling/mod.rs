//! Signaling wire codec and the in-process transport
pub mod codec;
pub mod memory;

pub use codec::SignalingCodec;
pub use memory::{MemorySignalingHub, MemorySignalingTransport};
