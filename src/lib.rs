//! CallCore - WebRTC call-session coordination
//!
//! This is a Domain-Driven Design (DDD) implementation of the session core
//! of a 1:1 and small-group calling client. It negotiates one peer link per
//! remote participant, aggregates their states into a single call state and
//! talks to the outside world through pluggable media and signaling ports.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{CallEventBus, CallSession, CallStats, SessionContext, SessionManager};
pub use config::Config;
pub use domain::shared::error::CallError;
pub use domain::shared::result::Result;
