//! Call permission policy
//!
//! Decides whether two participants may call each other at all. Checked by
//! the session manager before an outgoing call is placed and before an
//! incoming offer is surfaced.

use crate::domain::shared::value_objects::ParticipantId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;

#[async_trait]
pub trait CallPolicy: Send + Sync {
    async fn can_call(&self, from: &ParticipantId, to: &ParticipantId) -> bool;
}

/// Permits every call
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl CallPolicy for AllowAll {
    async fn can_call(&self, _from: &ParticipantId, _to: &ParticipantId) -> bool {
        true
    }
}

/// Denies calls in either direction between the local user and a blocked participant
#[derive(Debug, Default)]
pub struct BlockList {
    blocked: RwLock<HashSet<ParticipantId>>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, participant: ParticipantId) {
        self.blocked.write().insert(participant);
    }

    pub fn unblock(&self, participant: &ParticipantId) -> bool {
        self.blocked.write().remove(participant)
    }

    pub fn is_blocked(&self, participant: &ParticipantId) -> bool {
        self.blocked.read().contains(participant)
    }
}

#[async_trait]
impl CallPolicy for BlockList {
    async fn can_call(&self, from: &ParticipantId, to: &ParticipantId) -> bool {
        !self.is_blocked(from) && !self.is_blocked(to)
    }
}
