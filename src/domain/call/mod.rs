//! Call bounded context - value objects, events and ports for call sessions

pub mod event;
pub mod history;
pub mod policy;
pub mod value_object;

pub use event::{CallEvent, CallEventEnvelope};
pub use history::{CallHistory, CallRecord};
pub use policy::{AllowAll, BlockList, CallPolicy};
pub use value_object::{
    CallDirection, CallKind, CallOutcome, EndReason, LinkRole, MediaFlags, PeerLinkState,
    SessionState,
};
