//! Application layer - Use cases and application services
//!
//! This layer orchestrates domain objects to fulfill use cases.
//! It's responsible for:
//! - Driving call sessions and their peer links
//! - Enforcing the single-call slot
//! - Publishing call events to the UI

pub mod call_session;
pub mod events;
pub mod metrics;
pub mod session_manager;

pub use call_session::{CallSession, CallStats, SessionContext};
pub use events::CallEventBus;
pub use session_manager::SessionManager;
