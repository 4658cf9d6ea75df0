//! Domain layer - Core call concepts and the ports the core consumes
//!
//! This layer contains:
//! - Value Objects: identifiers, call kinds, session and link states
//! - Domain Events: what the UI layer subscribes to
//! - Ports: media engine, signaling transport, call history, call policy

pub mod call;
pub mod media;
pub mod shared;
pub mod signaling;

// Re-export commonly used types
pub use shared::{CallError, Result};
